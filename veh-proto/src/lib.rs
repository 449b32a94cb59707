// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Typed call protocol between the host runtime and an enclave image.
//!
//! Every call crossing the boundary is a named entry point plus a
//! postcard-encoded payload. Each message type carries its entry-point name
//! and its reply type, so both sides marshal through the same definitions.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod caller;
pub mod server;

use alloc::string::String;
use alloc::vec::Vec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use veh_types::{Status, VehResult, CPUID_LEAF_COUNT, CPUID_REG_COUNT};

/// A call the host dispatches into the enclave.
pub trait EnclaveCall: Serialize {
    const NAME: &'static str;
    type Reply: DeserializeOwned;
}

/// A call the enclave dispatches out to the host.
pub trait HostCall: Serialize {
    const NAME: &'static str;
    type Reply: DeserializeOwned;
}

pub fn encode<T: Serialize>(value: &T) -> VehResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|_| Status::Unexpected)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> VehResult<T> {
    postcard::from_bytes(bytes).map_err(|_| Status::InvalidParameter)
}

/// Return code of one enclave test entry; `0` means pass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub i32);

/// The CPUID table as observed through the emulation path, in
/// supported-leaf order.
pub type CpuidDump = [[u32; CPUID_REG_COUNT]; CPUID_LEAF_COUNT];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestVectorException {
    pub use_handler_stack: bool,
}

impl EnclaveCall for TestVectorException {
    const NAME: &'static str = "enc_test_vector_exception";
    type Reply = ReturnCode;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOcallInHandler {
    pub use_handler_stack: bool,
}

impl EnclaveCall for TestOcallInHandler {
    const NAME: &'static str = "enc_test_ocall_in_handler";
    type Reply = ReturnCode;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSigillHandling {
    pub use_handler_stack: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigillReply {
    pub ret: i32,
    pub cpuid_table: CpuidDump,
}

impl EnclaveCall for TestSigillHandling {
    const NAME: &'static str = "enc_test_sigill_handling";
    type Reply = SigillReply;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestCpuidInGlobalConstructors;

impl EnclaveCall for TestCpuidInGlobalConstructors {
    const NAME: &'static str = "enc_test_cpuid_in_global_constructors";
    type Reply = ();
}

/// Host callback invoked from inside fault handling; the host records that
/// it ran.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetWasOcallCalled;

impl HostCall for SetWasOcallCalled {
    const NAME: &'static str = "host_set_was_ocall_called";
    type Reply = ();
}

/// Enclave console output, line-buffered by the caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrintString {
    pub s: String,
}

impl HostCall for PrintString {
    const NAME: &'static str = "ocall_print_string";
    type Reply = ();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigill_reply_roundtrip() {
        let reply = SigillReply {
            ret: 0,
            cpuid_table: [[0x1122_3344; CPUID_REG_COUNT]; CPUID_LEAF_COUNT],
        };
        let bytes = encode(&reply).unwrap();
        let back: SigillReply = decode(&bytes).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<SigillReply>(&[0xff]).unwrap_err();
        assert_eq!(err, Status::InvalidParameter);
    }
}
