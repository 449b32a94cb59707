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

//! Untrusted runtime: enclave instance lifecycle and synchronous call
//! dispatch.
//!
//! An [`EnclaveImage`] linked into the process stands in for a loaded
//! enclave binary. Creation wires the host-call bridge, initializes the
//! trusted runtime, and runs the image's global constructors; afterwards
//! the host invokes named entry points and receives a status/result pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use veh_proto::caller::HostCaller;
use veh_proto::server::EnclaveImage;
use veh_proto::{EnclaveCall, HostCall};
use veh_types::{Status, VehResult};

#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
pub mod simulate;

pub type OcallFn = Box<dyn Fn(&[u8]) -> VehResult<Vec<u8>> + Send + Sync>;

/// Host functions the enclave may call, looked up by name.
#[derive(Default)]
pub struct OcallTable {
    map: HashMap<&'static str, OcallFn>,
}

impl OcallTable {
    pub fn new() -> Self {
        OcallTable {
            map: HashMap::new(),
        }
    }

    /// Register a typed host function for calls of type `C`.
    pub fn register<C, F>(&mut self, f: F)
    where
        C: HostCall + serde::de::DeserializeOwned,
        C::Reply: serde::Serialize,
        F: Fn(C) -> VehResult<C::Reply> + Send + Sync + 'static,
    {
        self.map.insert(
            C::NAME,
            Box::new(move |payload| {
                let call: C = veh_proto::decode(payload)?;
                let reply = f(call)?;
                veh_proto::encode(&reply)
            }),
        );
    }

    fn get(&self, name: &str) -> Option<&OcallFn> {
        self.map.get(name)
    }
}

struct HostBridge {
    ocalls: Arc<OcallTable>,
}

impl HostCaller for HostBridge {
    fn host_call(&self, name: &str, payload: &[u8]) -> VehResult<Vec<u8>> {
        let f = self.ocalls.get(name).ok_or_else(|| {
            error!("enclave requested unknown host function {name:?}");
            Status::InvalidFunction
        })?;
        debug!("host call {name:?} ({} bytes in)", payload.len());
        f(payload)
    }
}

static NEXT_EID: AtomicU64 = AtomicU64::new(1);

/// A created enclave instance. Calls are synchronous and blocking; the
/// design assumes no overlapping invocations against one instance.
pub struct Enclave {
    eid: u64,
    image: &'static EnclaveImage,
    ocalls: Arc<OcallTable>,
    dead: AtomicBool,
}

impl Enclave {
    /// Create an instance of `image`: wire the host bridge, run trusted
    /// runtime init, then the image's global constructors, in that order.
    pub fn create(image: &'static EnclaveImage, ocalls: OcallTable) -> VehResult<Enclave> {
        let eid = NEXT_EID.fetch_add(1, Ordering::Relaxed);
        let ocalls = Arc::new(ocalls);
        let bridge: Arc<dyn HostCaller> = Arc::new(HostBridge {
            ocalls: ocalls.clone(),
        });
        (image.init)(bridge)?;
        for ctor in image.constructors {
            ctor();
        }
        info!("created enclave {:?} eid={eid}", image.name);
        Ok(Enclave {
            eid,
            image,
            ocalls,
            dead: AtomicBool::new(false),
        })
    }

    pub fn geteid(&self) -> u64 {
        self.eid
    }

    pub fn image(&self) -> &'static EnclaveImage {
        self.image
    }

    /// Invoke a named entry point with a raw payload.
    pub fn ecall_raw(&self, name: &str, payload: &[u8]) -> VehResult<Vec<u8>> {
        if self.dead.load(Ordering::Acquire) {
            return Err(Status::EnclaveLost);
        }
        let f = self.image.find_ecall(name).ok_or(Status::InvalidFunction)?;
        debug!("ecall {name:?} eid={}", self.eid);
        let result = f(payload);
        if result == Err(Status::EnclaveCrashed) {
            error!("enclave eid={} crashed in {name:?}", self.eid);
            self.dead.store(true, Ordering::Release);
        }
        result
    }

    /// Invoke a typed entry point.
    pub fn ecall<C: EnclaveCall>(&self, call: &C) -> VehResult<C::Reply> {
        let payload = veh_proto::encode(call)?;
        let reply = self.ecall_raw(C::NAME, &payload)?;
        veh_proto::decode(&reply)
    }

    pub fn destroy(self) {
        info!("destroying enclave eid={}", self.eid);
        drop(self.ocalls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veh_proto::server::EnclaveImage;
    use veh_types::{ExceptionInfo, HandlerOutcome};

    fn nop_init(_host: Arc<dyn HostCaller>) -> VehResult<()> {
        Ok(())
    }

    fn nop_exception_entry(_info: &mut ExceptionInfo) -> HandlerOutcome {
        HandlerOutcome::ContinueSearch
    }

    fn echo_ecall(payload: &[u8]) -> VehResult<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn crash_ecall(_payload: &[u8]) -> VehResult<Vec<u8>> {
        Err(Status::EnclaveCrashed)
    }

    static TEST_IMAGE: EnclaveImage = EnclaveImage {
        name: "urts_test",
        init: nop_init,
        constructors: &[],
        ecalls: &[("echo", echo_ecall), ("crash", crash_ecall)],
        exception_entry: nop_exception_entry,
    };

    #[test]
    fn dispatches_named_ecalls() {
        let enclave = Enclave::create(&TEST_IMAGE, OcallTable::new()).unwrap();
        assert_eq!(enclave.ecall_raw("echo", &[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert_eq!(
            enclave.ecall_raw("missing", &[]).unwrap_err(),
            Status::InvalidFunction
        );
        enclave.destroy();
    }

    #[test]
    fn a_crashed_instance_is_lost() {
        let enclave = Enclave::create(&TEST_IMAGE, OcallTable::new()).unwrap();
        assert_eq!(
            enclave.ecall_raw("crash", &[]).unwrap_err(),
            Status::EnclaveCrashed
        );
        assert_eq!(
            enclave.ecall_raw("echo", &[]).unwrap_err(),
            Status::EnclaveLost
        );
        enclave.destroy();
    }

    #[test]
    fn constructors_run_after_init() {
        use std::sync::atomic::AtomicU32;
        static ORDER: AtomicU32 = AtomicU32::new(0);

        fn marking_init(_host: Arc<dyn HostCaller>) -> VehResult<()> {
            ORDER.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok();
            Ok(())
        }
        fn marking_ctor() {
            // Only valid after init has run.
            ORDER.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
                .ok();
        }

        static CTOR_IMAGE: EnclaveImage = EnclaveImage {
            name: "ctor_test",
            init: marking_init,
            constructors: &[marking_ctor],
            ecalls: &[],
            exception_entry: nop_exception_entry,
        };

        let enclave = Enclave::create(&CTOR_IMAGE, OcallTable::new()).unwrap();
        assert_eq!(ORDER.load(Ordering::SeqCst), 2);
        enclave.destroy();
    }

    #[test]
    fn ocall_table_dispatches_typed_calls() {
        use std::sync::atomic::AtomicU32;
        static CALLS: AtomicU32 = AtomicU32::new(0);

        let mut table = OcallTable::new();
        table.register(|_: veh_proto::SetWasOcallCalled| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let bridge = HostBridge {
            ocalls: Arc::new(table),
        };

        let payload = veh_proto::encode(&veh_proto::SetWasOcallCalled).unwrap();
        bridge
            .host_call("host_set_was_ocall_called", &payload)
            .unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(
            bridge.host_call("nope", &[]).unwrap_err(),
            Status::InvalidFunction
        );
    }
}
