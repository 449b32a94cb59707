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

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::caller::HostCaller;
use veh_types::{ExceptionInfo, HandlerOutcome, VehResult};

/// One named entry point: postcard payload in, postcard reply out.
pub type EcallFn = fn(&[u8]) -> VehResult<Vec<u8>>;

/// A global constructor of the enclave image, run after runtime init.
pub type ConstructorFn = fn();

/// The enclave's exception entry, invoked by the host trap bridge when a
/// hardware fault surfaces outside the enclave's own trap path.
pub type ExceptionEntryFn = fn(&mut ExceptionInfo) -> HandlerOutcome;

/// Static description of an enclave image hosted in-process.
///
/// This is the "load" half of the enclave-creation contract: the untrusted
/// runtime consumes it to initialize the image and to dispatch named calls.
pub struct EnclaveImage {
    pub name: &'static str,
    /// Wires the host-call bridge and initializes the trusted runtime.
    /// Runs before `constructors`.
    pub init: fn(Arc<dyn HostCaller>) -> VehResult<()>,
    pub constructors: &'static [ConstructorFn],
    pub ecalls: &'static [(&'static str, EcallFn)],
    pub exception_entry: ExceptionEntryFn,
}

impl EnclaveImage {
    pub fn find_ecall(&self, name: &str) -> Option<EcallFn> {
        self.ecalls
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }
}
