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

//! Vectored exception dispatch.
//!
//! Faults walk an ordered chain of registered handlers; the first handler
//! to claim one wins. A fault nobody claims kills the instance. Dispatch is
//! re-entrant: a handler body may itself fault (or raise one), and the
//! nested fault runs through the same machine.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::{Once, RwLock};
use veh_types::{
    CpuContext, DispatchOutcome, ExceptionInfo, ExceptionType, ExceptionVector, HandlerOutcome,
    Status, VehResult,
};

use crate::stack;

/// A fault handler: claims the fault, declines it, or demands teardown.
pub type ExceptionHandler = fn(&mut ExceptionInfo) -> HandlerOutcome;

/// Opaque registration handle, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Clone, Copy)]
struct HandlerEntry {
    id: u64,
    handler: ExceptionHandler,
}

/// Bound on simultaneously registered handlers; enclave resources are fixed
/// at build time.
pub const MAX_VECTORED_HANDLERS: usize = 64;

static HANDLER_CHAIN: RwLock<Vec<HandlerEntry>> = RwLock::new(Vec::new());
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);
static DISPATCH_DEPTH: AtomicUsize = AtomicUsize::new(0);
static DEFAULT_HANDLERS: Once<()> = Once::new();

/// Append a handler to the chain, or prepend it when `first` is set.
pub fn register_exception_handler(
    first: bool,
    handler: ExceptionHandler,
) -> VehResult<HandlerId> {
    let mut chain = HANDLER_CHAIN.write();
    if chain.len() >= MAX_VECTORED_HANDLERS {
        return Err(Status::InvalidState);
    }
    let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
    let entry = HandlerEntry { id, handler };
    if first {
        chain.insert(0, entry);
    } else {
        chain.push(entry);
    }
    Ok(HandlerId(id))
}

/// Remove a previously registered handler. Returns `false` for an unknown
/// or already removed handle.
pub fn unregister_exception_handler(id: HandlerId) -> bool {
    let mut chain = HANDLER_CHAIN.write();
    let before = chain.len();
    chain.retain(|e| e.id != id.0);
    chain.len() != before
}

#[cfg(test)]
pub(crate) fn handler_count() -> usize {
    HANDLER_CHAIN.read().len()
}

/// Whether a fault dispatch is currently in flight on this call stack.
pub fn in_dispatch() -> bool {
    DISPATCH_DEPTH.load(Ordering::Acquire) > 0
}

/// Register the runtime's built-in handlers. One-shot; reinitializing an
/// instance must not double them up.
pub(crate) fn install_default_handlers() {
    DEFAULT_HANDLERS.call_once(|| {
        let _ = register_exception_handler(false, crate::cpuid::cpuid_exception_handler);
    });
}

/// Disposition of one walk over the handler chain. The discriminants follow
/// the SGX continue-execution/continue-search convention so the value can
/// cross the stack-switch trampoline as a plain integer.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainOutcome {
    Claimed = -1,
    Unclaimed = 0,
    Aborted = -2,
}

pub(crate) fn walk_chain(info: &mut ExceptionInfo) -> ChainOutcome {
    // Snapshot the chain so handlers may register or unregister freely
    // while the walk is in progress.
    let chain: Vec<HandlerEntry> = (*HANDLER_CHAIN.read()).clone();
    for entry in chain {
        match (entry.handler)(info) {
            HandlerOutcome::ContinueExecution => return ChainOutcome::Claimed,
            HandlerOutcome::ContinueSearch => {}
            HandlerOutcome::AbortExecution => return ChainOutcome::Aborted,
        }
    }
    ChainOutcome::Unclaimed
}

struct DepthGuard;

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.fetch_sub(1, Ordering::Release);
    }
}

/// Run one captured fault through the dispatch state machine.
///
/// Armed -> FaultEntered -> Dispatching -> Resuming | Fatal. On the
/// outermost entry the chain runs on the configured alternate stack, if
/// any; nested entries stay on the stack they are already on.
pub fn dispatch_exception(info: &mut ExceptionInfo) -> DispatchOutcome {
    // FaultEntered
    let depth = DISPATCH_DEPTH.fetch_add(1, Ordering::Acquire);
    let _depth_guard = DepthGuard;

    match info.exception_type {
        ExceptionType::Hardware | ExceptionType::Simulated => {}
        ExceptionType::Software => {
            log::error!("refusing to dispatch a software-injected exception");
            crate::set_aborted();
            return DispatchOutcome::Fatal;
        }
    }

    let handler_stack = stack::exception_handler_stack();
    info.handler_stack_requested = handler_stack.is_some();

    // Dispatching
    let outcome = match handler_stack {
        Some(region) if depth == 0 => unsafe { stack::walk_on_stack(region, info) },
        _ => walk_chain(info),
    };

    match outcome {
        // Resuming: the claimed context, including the advanced instruction
        // pointer, is the architectural state to continue from.
        ChainOutcome::Claimed => DispatchOutcome::Resumed,
        ChainOutcome::Unclaimed => {
            log::error!(
                "unhandled exception: vector {:?} at {:#x}",
                info.vector,
                info.cpu_context.rip
            );
            crate::set_aborted();
            DispatchOutcome::Fatal
        }
        ChainOutcome::Aborted => {
            log::error!(
                "handler demanded abort: vector {:?} at {:#x}",
                info.vector,
                info.cpu_context.rip
            );
            crate::set_aborted();
            DispatchOutcome::Fatal
        }
    }
}

/// Software trap entry for an illegal-instruction fault.
///
/// `ctx.rip` must point at the faulting instruction's encoding. On resume
/// the snapshot holds the rewritten registers and the advanced instruction
/// pointer, exactly as a hardware trap return would leave them.
pub fn raise_illegal_instruction(ctx: &mut CpuContext) -> DispatchOutcome {
    let mut info = ExceptionInfo::new(
        *ctx,
        ExceptionVector::UndefinedOpcode,
        ExceptionType::Simulated,
    );
    let outcome = dispatch_exception(&mut info);
    if outcome == DispatchOutcome::Resumed {
        *ctx = info.cpu_context;
    }
    outcome
}
