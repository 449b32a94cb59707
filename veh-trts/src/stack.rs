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

//! Alternate exception-handler stack.
//!
//! Handler bodies may run on a caller-owned memory region instead of the
//! faulting stack, bounding the extra stack consumption of fault handling.
//! The switch happens only on the outermost dispatch; a nested fault is
//! part of the same call stack and stays where it is.

use spin::RwLock;
use veh_types::ExceptionInfo;

use crate::veh::ChainOutcome;

/// Two pages, the least a handler body is allowed to run on.
pub const MIN_HANDLER_STACK_SIZE: usize = 8192;

/// A caller-owned memory region used as the handler stack.
///
/// The caller guarantees the region stays valid and unused for anything
/// else while it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Sixteen-byte aligned top of the region, where the stack pointer
    /// starts.
    fn top(&self) -> usize {
        (self.base + self.size) & !0xf
    }
}

static HANDLER_STACK: RwLock<Option<StackRegion>> = RwLock::new(None);

/// Configure (or with `None`, clear) the handler stack for this execution
/// context. Rejects a null base or a region smaller than
/// [`MIN_HANDLER_STACK_SIZE`].
pub fn set_exception_handler_stack(region: Option<StackRegion>) -> bool {
    match region {
        None => {
            *HANDLER_STACK.write() = None;
            true
        }
        Some(r) => {
            if r.base == 0 || r.size < MIN_HANDLER_STACK_SIZE {
                return false;
            }
            *HANDLER_STACK.write() = Some(r);
            true
        }
    }
}

pub fn exception_handler_stack() -> Option<StackRegion> {
    *HANDLER_STACK.read()
}

extern "C" fn chain_thunk(info: *mut ExceptionInfo) -> i32 {
    // SAFETY: `walk_on_stack` passes a live exclusive borrow through the
    // trampoline; nothing else touches it until the call returns.
    crate::veh::walk_chain(unsafe { &mut *info }) as i32
}

/// Walk the handler chain with the stack pointer moved to `region`.
///
/// The original stack pointer is restored on every return path; the guard
/// against re-switching on nested faults lives in the dispatcher.
///
/// # Safety
///
/// `region` must be valid, writable memory owned by the caller for the
/// whole duration of the walk.
pub(crate) unsafe fn walk_on_stack(region: StackRegion, info: &mut ExceptionInfo) -> ChainOutcome {
    match switch_stack(region.top(), chain_thunk, info as *mut ExceptionInfo) {
        -1 => ChainOutcome::Claimed,
        -2 => ChainOutcome::Aborted,
        _ => ChainOutcome::Unclaimed,
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn switch_stack(
    top: usize,
    thunk: extern "C" fn(*mut ExceptionInfo) -> i32,
    info: *mut ExceptionInfo,
) -> i32 {
    let thunk_addr = thunk as usize;
    let ret: i32;
    // Save the old stack pointer on the new stack (twice, keeping the
    // sixteen-byte alignment the call requires), call the thunk there, and
    // pop the old stack pointer back on return.
    core::arch::asm!(
        "mov r10, rsp",
        "mov rsp, rsi",
        "push r10",
        "push r10",
        "call rdx",
        "pop rsp",
        inout("rsi") top => _,
        inout("rdx") thunk_addr => _,
        inout("rdi") info => _,
        out("r10") _,
        lateout("rax") ret,
        clobber_abi("sysv64"),
    );
    ret
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn switch_stack(
    _top: usize,
    thunk: extern "C" fn(*mut ExceptionInfo) -> i32,
    info: *mut ExceptionInfo,
) -> i32 {
    thunk(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{init_bare_runtime, TEST_MUTEX};
    use crate::veh::{
        raise_illegal_instruction, register_exception_handler, unregister_exception_handler,
    };
    use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
    use veh_types::{CpuContext, DispatchOutcome, ExceptionInfo, HandlerOutcome};

    #[test]
    fn region_validation() {
        let _guard = TEST_MUTEX.lock().unwrap();

        assert!(!set_exception_handler_stack(Some(StackRegion {
            base: 0,
            size: 1 << 20,
        })));
        assert!(!set_exception_handler_stack(Some(StackRegion {
            base: 0x1000,
            size: MIN_HANDLER_STACK_SIZE - 1,
        })));
        assert!(set_exception_handler_stack(Some(StackRegion {
            base: 0x1000,
            size: MIN_HANDLER_STACK_SIZE,
        })));
        assert!(set_exception_handler_stack(None));
        assert_eq!(exception_handler_stack(), None);
    }

    const TEST_STACK_SIZE: usize = 32 * 1024;

    static UD2_SITE: [u8; 2] = [0x0f, 0x0b];
    // UD1 encoding, so the two sites stay distinct
    static NESTED_SITE: [u8; 2] = [0x0f, 0xb9];

    // 0 = unset, 1 = handler ran on the region, 2 = it did not
    static OUTER_RESIDENCY: AtomicU8 = AtomicU8::new(0);
    static NESTED_RESIDENCY: AtomicU8 = AtomicU8::new(0);
    static OUTER_LOCAL_ADDR: AtomicUsize = AtomicUsize::new(0);
    static NESTED_LOCAL_ADDR: AtomicUsize = AtomicUsize::new(0);

    fn residency(region: Option<StackRegion>) -> (u8, usize) {
        let marker = 0u8;
        let addr = &marker as *const u8 as usize;
        let on = region.map(|r| r.contains(addr)).unwrap_or(false);
        (if on { 1 } else { 2 }, addr)
    }

    fn outer_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
        if info.cpu_context.rip != UD2_SITE.as_ptr() as u64 {
            return HandlerOutcome::ContinueSearch;
        }
        let (flag, addr) = residency(exception_handler_stack());
        OUTER_RESIDENCY.store(flag, Ordering::SeqCst);
        OUTER_LOCAL_ADDR.store(addr, Ordering::SeqCst);

        // Nested fault while already on the handler stack.
        let mut ctx = CpuContext {
            rip: NESTED_SITE.as_ptr() as u64,
            ..Default::default()
        };
        if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
            return HandlerOutcome::ContinueSearch;
        }

        info.cpu_context.rip += UD2_SITE.len() as u64;
        HandlerOutcome::ContinueExecution
    }

    fn nested_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
        if info.cpu_context.rip != NESTED_SITE.as_ptr() as u64 {
            return HandlerOutcome::ContinueSearch;
        }
        let (flag, addr) = residency(exception_handler_stack());
        NESTED_RESIDENCY.store(flag, Ordering::SeqCst);
        NESTED_LOCAL_ADDR.store(addr, Ordering::SeqCst);
        info.cpu_context.rip += NESTED_SITE.len() as u64;
        HandlerOutcome::ContinueExecution
    }

    #[test]
    fn handlers_run_on_the_configured_stack() {
        let _guard = TEST_MUTEX.lock().unwrap();
        init_bare_runtime();

        let buf = vec![0u8; TEST_STACK_SIZE].into_boxed_slice();
        let region = StackRegion {
            base: buf.as_ptr() as usize,
            size: buf.len(),
        };
        assert!(set_exception_handler_stack(Some(region)));

        OUTER_RESIDENCY.store(0, Ordering::SeqCst);
        NESTED_RESIDENCY.store(0, Ordering::SeqCst);
        let outer = register_exception_handler(false, outer_handler).unwrap();
        let nested = register_exception_handler(false, nested_handler).unwrap();

        let mut ctx = CpuContext {
            rip: UD2_SITE.as_ptr() as u64,
            ..Default::default()
        };
        assert_eq!(raise_illegal_instruction(&mut ctx), DispatchOutcome::Resumed);

        assert_eq!(OUTER_RESIDENCY.load(Ordering::SeqCst), 1);
        // The nested dispatch stayed on the handler stack instead of
        // resetting to its top: its frame sits below the outer one.
        assert_eq!(NESTED_RESIDENCY.load(Ordering::SeqCst), 1);
        assert!(
            NESTED_LOCAL_ADDR.load(Ordering::SeqCst) < OUTER_LOCAL_ADDR.load(Ordering::SeqCst)
        );

        assert!(unregister_exception_handler(outer));
        assert!(unregister_exception_handler(nested));
        assert!(set_exception_handler_stack(None));
        drop(buf);
    }

    #[test]
    fn handlers_stay_on_the_faulting_stack_by_default() {
        let _guard = TEST_MUTEX.lock().unwrap();
        init_bare_runtime();

        OUTER_RESIDENCY.store(0, Ordering::SeqCst);
        NESTED_RESIDENCY.store(0, Ordering::SeqCst);
        let outer = register_exception_handler(false, outer_handler).unwrap();
        let nested = register_exception_handler(false, nested_handler).unwrap();

        let mut ctx = CpuContext {
            rip: UD2_SITE.as_ptr() as u64,
            ..Default::default()
        };
        assert_eq!(raise_illegal_instruction(&mut ctx), DispatchOutcome::Resumed);
        assert_eq!(OUTER_RESIDENCY.load(Ordering::SeqCst), 2);
        assert_eq!(NESTED_RESIDENCY.load(Ordering::SeqCst), 2);

        assert!(unregister_exception_handler(outer));
        assert!(unregister_exception_handler(nested));
    }
}
