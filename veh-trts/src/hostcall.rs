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

//! Host-mediated calls out of the enclave.
//!
//! The untrusted runtime installs a [`HostCaller`] bridge at instance
//! creation; everything leaving the enclave goes through it. The
//! in-handler variant is the one fault handlers use to request host work
//! without leaving fault context improperly.

use alloc::string::String;
use alloc::sync::Arc;

use spin::RwLock;
use veh_proto::caller::HostCaller;
use veh_proto::{HostCall, PrintString};
use veh_types::{Status, VehResult};

static HOST_CALLER: RwLock<Option<Arc<dyn HostCaller>>> = RwLock::new(None);

pub(crate) fn set_host_caller(caller: Arc<dyn HostCaller>) {
    *HOST_CALLER.write() = Some(caller);
}

/// Issue a typed call to the host.
pub fn host_call<C: HostCall>(call: &C) -> VehResult<C::Reply> {
    let caller = HOST_CALLER
        .read()
        .as_ref()
        .cloned()
        .ok_or(Status::InvalidState)?;
    veh_proto::caller::host_call(caller.as_ref(), call)
}

/// Issue a typed call to the host from inside fault handling.
///
/// Only legal while a dispatch is in flight; the dispatcher does not
/// resume the faulting instruction until the call returns. A failure here
/// means the handler must decline the fault rather than resume with
/// undefined register state.
pub fn host_call_in_handler<C: HostCall>(call: &C) -> VehResult<C::Reply> {
    if !crate::veh::in_dispatch() {
        return Err(Status::InvalidState);
    }
    host_call(call)
}

pub fn print_str(s: &str) {
    let _ = host_call(&PrintString { s: String::from(s) });
}

pub fn print_args(args: core::fmt::Arguments<'_>) {
    print_str(&alloc::format!("{}", args));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::hostcall::print_args(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::hostcall::print_args(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

struct BridgeLogger;

impl log::Log for BridgeLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        print_str(&alloc::format!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: BridgeLogger = BridgeLogger;

pub(crate) fn init_logging() {
    // Only the first instance in a process wins; later inits keep the
    // already-installed logger.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{init_bare_runtime, RecordingHost, TEST_MUTEX};
    use crate::veh::{register_exception_handler, unregister_exception_handler};
    use core::sync::atomic::{AtomicI32, Ordering};
    use veh_proto::SetWasOcallCalled;
    use veh_types::{
        CpuContext, DispatchOutcome, ExceptionInfo, HandlerOutcome,
    };

    #[test]
    fn in_handler_call_is_rejected_outside_dispatch() {
        let _guard = TEST_MUTEX.lock().unwrap();
        init_bare_runtime();
        set_host_caller(Arc::new(RecordingHost::new()));

        assert_eq!(
            host_call_in_handler(&SetWasOcallCalled).unwrap_err(),
            Status::InvalidState
        );
    }

    static OCALL_SITE: [u8; 2] = [0x0f, 0x0b];
    static OCALL_RESULT: AtomicI32 = AtomicI32::new(-1);

    fn ocall_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
        if info.cpu_context.rip != OCALL_SITE.as_ptr() as u64 {
            return HandlerOutcome::ContinueSearch;
        }
        match host_call_in_handler(&SetWasOcallCalled) {
            Ok(()) => {
                OCALL_RESULT.store(0, Ordering::SeqCst);
                info.cpu_context.rip += OCALL_SITE.len() as u64;
                HandlerOutcome::ContinueExecution
            }
            Err(_) => HandlerOutcome::ContinueSearch,
        }
    }

    #[test]
    fn handler_reaches_the_host_mid_fault() {
        let _guard = TEST_MUTEX.lock().unwrap();
        init_bare_runtime();
        let host = Arc::new(RecordingHost::new());
        set_host_caller(host.clone());

        OCALL_RESULT.store(-1, Ordering::SeqCst);
        let id = register_exception_handler(false, ocall_handler).unwrap();

        let mut ctx = CpuContext {
            rip: OCALL_SITE.as_ptr() as u64,
            ..Default::default()
        };
        assert_eq!(
            crate::veh::raise_illegal_instruction(&mut ctx),
            DispatchOutcome::Resumed
        );
        assert_eq!(OCALL_RESULT.load(Ordering::SeqCst), 0);
        assert_eq!(
            *host.calls.lock().unwrap(),
            ["host_set_was_ocall_called"]
        );

        assert!(unregister_exception_handler(id));
    }
}
