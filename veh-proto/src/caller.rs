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

use alloc::vec::Vec;

use crate::HostCall;
use veh_types::VehResult;

/// The narrow contract through which the enclave reaches host services.
///
/// The untrusted runtime installs an implementation at enclave creation;
/// the trusted runtime only ever sees this trait.
pub trait HostCaller: Send + Sync {
    fn host_call(&self, name: &str, payload: &[u8]) -> VehResult<Vec<u8>>;
}

/// Issue a typed host call through a [`HostCaller`].
pub fn host_call<C: HostCall>(caller: &dyn HostCaller, call: &C) -> VehResult<C::Reply> {
    let payload = crate::encode(call)?;
    let reply = caller.host_call(C::NAME, &payload)?;
    crate::decode(&reply)
}
