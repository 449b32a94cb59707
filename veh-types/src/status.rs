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

use core::fmt;

/// Status code returned across the host/enclave boundary.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success = 0,
    /// Generic unexpected failure.
    Unexpected = 1,
    /// A parameter failed validation (including undecodable call payloads).
    InvalidParameter = 2,
    /// The operation is not legal in the current runtime state.
    InvalidState = 3,
    /// No entry point or host function with the requested name exists.
    InvalidFunction = 4,
    /// The enclave hit an unrecoverable fault during this call.
    EnclaveCrashed = 5,
    /// The enclave instance is dead; no further calls are possible.
    EnclaveLost = 6,
    /// A host-mediated call failed in the marshalling layer.
    OcallFailed = 7,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Unexpected => "Unexpected error",
            Status::InvalidParameter => "Invalid parameter",
            Status::InvalidState => "Invalid state",
            Status::InvalidFunction => "Invalid function",
            Status::EnclaveCrashed => "Enclave crashed",
            Status::EnclaveLost => "Enclave lost",
            Status::OcallFailed => "OCALL failed",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type VehResult<T> = Result<T, Status>;
