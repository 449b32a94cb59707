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

//! Trusted runtime for in-enclave vectored exception handling.
//!
//! The enclave cannot execute CPUID; the fault it raises is intercepted
//! here, classified, and either answered from a table captured at
//! initialization or forwarded down a chain of registered handlers. The
//! dispatcher is re-entrant and can run handler bodies on a caller-supplied
//! alternate stack.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cpuid;
pub mod hostcall;
pub mod stack;
pub mod veh;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use veh_proto::caller::HostCaller;
use veh_types::VehResult;

pub use cpuid::{classify, cpuid_lookup, emulated_cpuid, Classified, CpuidEntry};
pub use hostcall::{host_call, host_call_in_handler};
pub use stack::{set_exception_handler_stack, StackRegion, MIN_HANDLER_STACK_SIZE};
pub use veh::{
    dispatch_exception, raise_illegal_instruction, register_exception_handler,
    unregister_exception_handler, ExceptionHandler, HandlerId,
};

static ABORTED: AtomicBool = AtomicBool::new(false);

/// Whether a fault went unclaimed (or a handler demanded abort) since the
/// last runtime init. A dead instance accepts no further entry calls.
pub fn enclave_aborted() -> bool {
    ABORTED.load(Ordering::Acquire)
}

pub(crate) fn set_aborted() {
    ABORTED.store(true, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn clear_aborted() {
    ABORTED.store(false, Ordering::Release);
}

/// Initialize the trusted runtime for a freshly created enclave instance.
///
/// Order matters: the CPUID table is captured before the built-in handlers
/// are armed and before the image's global constructors run, so no
/// constructor can observe an unpopulated entry.
pub fn runtime_init(host: Arc<dyn HostCaller>) -> VehResult<()> {
    hostcall::set_host_caller(host);
    hostcall::init_logging();
    cpuid::init_cpuid_table();
    veh::install_default_handlers();
    stack::set_exception_handler_stack(None);
    ABORTED.store(false, Ordering::Release);
    log::debug!("trusted runtime initialized");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    // Dispatcher state (handler chain, stack config, abort flag) is
    // enclave-wide; tests touching it run one at a time.
    pub static TEST_MUTEX: Mutex<()> = Mutex::new(());

    pub struct RecordingHost {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingHost {
        pub fn new() -> Self {
            RecordingHost {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostCaller for RecordingHost {
        fn host_call(&self, name: &str, _payload: &[u8]) -> VehResult<Vec<u8>> {
            self.calls.lock().unwrap().push(String::from(name));
            // postcard encoding of `()` is empty
            Ok(Vec::new())
        }
    }

    /// Arm the table and built-in handlers without a host bridge.
    pub fn init_bare_runtime() {
        cpuid::init_cpuid_table();
        veh::install_default_handlers();
        stack::set_exception_handler_stack(None);
        clear_aborted();
    }
}
