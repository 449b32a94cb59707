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

//! Simulation-mode trap bridge.
//!
//! When the image runs in-process, a prohibited instruction that actually
//! executes surfaces as a host `SIGILL` rather than an in-enclave trap.
//! This module converts such a signal into an [`ExceptionInfo`], forwards
//! it to the image's exception entry, and writes the rewritten registers
//! back into the signal context on a claimed fault. The previously
//! installed signal handler is preserved and can be chained to.

use iced_x86::{Code, Decoder, DecoderOptions};
use libc::{sigaction, siginfo_t, SA_NODEFER, SA_RESTART, SA_SIGINFO, SIGILL};
use std::mem;
use std::ptr;
use std::slice;
use std::sync::Mutex;
use tracing::{debug, info};
use veh_proto::server::{EnclaveImage, ExceptionEntryFn};
use veh_types::{
    CpuContext, ExceptionInfo, ExceptionType, ExceptionVector, HandlerOutcome, Status, VehResult,
};

use crate::{Enclave, OcallTable};

// Store the original SIGILL handler that was installed before ours
static ORIGINAL_SIGILL_HANDLER: Mutex<Option<sigaction>> = Mutex::new(None);

/// User-defined callback invoked after bridge processing.
pub type TrapCallback = fn(sig: libc::c_int, info: *mut siginfo_t, context: *mut libc::c_void);

struct BridgeConfig {
    chain: bool,
    callback: Option<TrapCallback>,
    entry: Option<ExceptionEntryFn>,
}

static BRIDGE_CONFIG: Mutex<Option<BridgeConfig>> = Mutex::new(None);

const MAX_INSTRUCTION_LEN: usize = 15;

// Helper function to write log messages to stderr without allocating
fn log_to_stderr(msg: &str) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

fn context_from_gregs(gregs: &[libc::greg_t; 23]) -> CpuContext {
    CpuContext {
        rax: gregs[libc::REG_RAX as usize] as u64,
        rcx: gregs[libc::REG_RCX as usize] as u64,
        rdx: gregs[libc::REG_RDX as usize] as u64,
        rbx: gregs[libc::REG_RBX as usize] as u64,
        rsp: gregs[libc::REG_RSP as usize] as u64,
        rbp: gregs[libc::REG_RBP as usize] as u64,
        rsi: gregs[libc::REG_RSI as usize] as u64,
        rdi: gregs[libc::REG_RDI as usize] as u64,
        r8: gregs[libc::REG_R8 as usize] as u64,
        r9: gregs[libc::REG_R9 as usize] as u64,
        r10: gregs[libc::REG_R10 as usize] as u64,
        r11: gregs[libc::REG_R11 as usize] as u64,
        r12: gregs[libc::REG_R12 as usize] as u64,
        r13: gregs[libc::REG_R13 as usize] as u64,
        r14: gregs[libc::REG_R14 as usize] as u64,
        r15: gregs[libc::REG_R15 as usize] as u64,
        rflags: gregs[libc::REG_EFL as usize] as u64,
        rip: gregs[libc::REG_RIP as usize] as u64,
    }
}

fn write_context_to_gregs(ctx: &CpuContext, gregs: &mut [libc::greg_t; 23]) {
    gregs[libc::REG_RAX as usize] = ctx.rax as libc::greg_t;
    gregs[libc::REG_RCX as usize] = ctx.rcx as libc::greg_t;
    gregs[libc::REG_RDX as usize] = ctx.rdx as libc::greg_t;
    gregs[libc::REG_RBX as usize] = ctx.rbx as libc::greg_t;
    gregs[libc::REG_RSP as usize] = ctx.rsp as libc::greg_t;
    gregs[libc::REG_RBP as usize] = ctx.rbp as libc::greg_t;
    gregs[libc::REG_RSI as usize] = ctx.rsi as libc::greg_t;
    gregs[libc::REG_RDI as usize] = ctx.rdi as libc::greg_t;
    gregs[libc::REG_R8 as usize] = ctx.r8 as libc::greg_t;
    gregs[libc::REG_R9 as usize] = ctx.r9 as libc::greg_t;
    gregs[libc::REG_R10 as usize] = ctx.r10 as libc::greg_t;
    gregs[libc::REG_R11 as usize] = ctx.r11 as libc::greg_t;
    gregs[libc::REG_R12 as usize] = ctx.r12 as libc::greg_t;
    gregs[libc::REG_R13 as usize] = ctx.r13 as libc::greg_t;
    gregs[libc::REG_R14 as usize] = ctx.r14 as libc::greg_t;
    gregs[libc::REG_R15 as usize] = ctx.r15 as libc::greg_t;
    gregs[libc::REG_EFL as usize] = ctx.rflags as libc::greg_t;
    gregs[libc::REG_RIP as usize] = ctx.rip as libc::greg_t;
}

// A SIGILL at `rip` is only forwarded when the faulting bytes decode to an
// instruction the enclave runtime knows how to judge.
fn decode_prohibited(rip: u64) -> Option<Code> {
    if rip == 0 {
        return None;
    }
    let bytes = unsafe { slice::from_raw_parts(rip as *const u8, MAX_INSTRUCTION_LEN) };
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    match instruction.code() {
        Code::Cpuid | Code::Ud2 => Some(instruction.code()),
        _ => None,
    }
}

// SIGILL handler bridging host faults into the enclave's exception entry
extern "C" fn sigill_bridge_handler(
    sig: libc::c_int,
    info: *mut siginfo_t,
    context: *mut libc::c_void,
) {
    let gregs = unsafe {
        let uc = context as *mut libc::ucontext_t;
        &mut (*uc).uc_mcontext.gregs
    };
    let rip = gregs[libc::REG_RIP as usize] as u64;

    log_to_stderr(&format!(
        "[VEH-URTS TRAP] SIGILL bridge called at RIP {rip:#x}\n"
    ));

    if let Ok(guard) = BRIDGE_CONFIG.lock() {
        if let Some(ref config) = *guard {
            if let (Some(entry), Some(code)) = (config.entry, decode_prohibited(rip)) {
                log_to_stderr(&format!(
                    "[VEH-URTS TRAP] Forwarding {code:?} fault to the enclave\n"
                ));
                let mut exception = ExceptionInfo::new(
                    context_from_gregs(gregs),
                    ExceptionVector::UndefinedOpcode,
                    ExceptionType::Hardware,
                );
                if entry(&mut exception) == HandlerOutcome::ContinueExecution {
                    write_context_to_gregs(&exception.cpu_context, gregs);
                    log_to_stderr(&format!(
                        "[VEH-URTS TRAP] Claimed; resuming at RIP {:#x}\n",
                        exception.cpu_context.rip
                    ));
                } else {
                    log_to_stderr("[VEH-URTS TRAP] Enclave declined the fault\n");
                }
            }

            // Call user callback if set
            if let Some(callback) = config.callback {
                callback(sig, info, context);
            }

            // Delegate to original handler if chaining is enabled
            if config.chain {
                delegate_to_original_handler(sig, info, context);
            }
        }
    }
}

// Helper to delegate to original handler
fn delegate_to_original_handler(
    sig: libc::c_int,
    info: *mut siginfo_t,
    context: *mut libc::c_void,
) {
    log_to_stderr("[VEH-URTS TRAP] Delegating to original handler\n");

    if let Ok(guard) = ORIGINAL_SIGILL_HANDLER.lock() {
        if let Some(ref original_handler) = *guard {
            if original_handler.sa_flags & SA_SIGINFO as libc::c_int != 0
                && original_handler.sa_sigaction != 0
            {
                log_to_stderr(&format!(
                    "[VEH-URTS TRAP] Calling original handler at {:p}\n",
                    original_handler.sa_sigaction as *const ()
                ));
                unsafe {
                    let handler: extern "C" fn(libc::c_int, *mut siginfo_t, *mut libc::c_void) =
                        mem::transmute(original_handler.sa_sigaction);
                    handler(sig, info, context);
                }
            }
        }
    }
}

/// Install the SIGILL trap bridge.
///
/// # Arguments
/// * `entry` - The enclave exception entry to forward decoded faults to.
/// * `chain` - If true, calls the original handler after processing. If false, handles the signal exclusively.
/// * `callback` - Optional user-defined callback to be called after processing the signal.
pub fn install_trap_bridge(
    entry: Option<ExceptionEntryFn>,
    chain: bool,
    callback: Option<TrapCallback>,
) -> Result<(), String> {
    // Get current SIGILL handler
    let mut current_handler: sigaction = unsafe { mem::zeroed() };
    unsafe {
        if sigaction(SIGILL, ptr::null(), &mut current_handler) != 0 {
            return Err("Failed to get current SIGILL handler".to_string());
        }
    }

    // Save existing handler
    if current_handler.sa_sigaction != 0 {
        if let Ok(mut guard) = ORIGINAL_SIGILL_HANDLER.lock() {
            *guard = Some(current_handler);
            debug!(
                "Saved original SIGILL handler at {:p}",
                current_handler.sa_sigaction as *const ()
            );
        } else {
            return Err("Failed to lock ORIGINAL_SIGILL_HANDLER".to_string());
        }
    }

    // Install our handler
    let mut sa: sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = sigill_bridge_handler as usize;
    sa.sa_flags = SA_SIGINFO | SA_NODEFER | SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);

        if sigaction(SIGILL, &sa, ptr::null_mut()) != 0 {
            return Err("Failed to install SIGILL handler".to_string());
        }
    }

    // Set bridge configuration
    if let Ok(mut guard) = BRIDGE_CONFIG.lock() {
        *guard = Some(BridgeConfig {
            chain,
            callback,
            entry,
        });
    } else {
        return Err("Failed to lock BRIDGE_CONFIG".to_string());
    }

    let mode = if chain { "chaining" } else { "exclusive" };
    let callback_str = if callback.is_some() {
        " with callback"
    } else {
        ""
    };
    info!(
        "SIGILL trap bridge installed successfully (mode: {}{})",
        mode, callback_str
    );
    Ok(())
}

/// Uninstall the trap bridge and restore the original SIGILL handler.
///
/// If no original handler was saved, the disposition goes back to SIG_DFL.
pub fn uninstall_trap_bridge() -> Result<(), String> {
    // Clear bridge configuration
    if let Ok(mut guard) = BRIDGE_CONFIG.lock() {
        *guard = None;
    } else {
        return Err("Failed to lock BRIDGE_CONFIG".to_string());
    }

    // Lock and get the original handler
    let original_handler = if let Ok(mut guard) = ORIGINAL_SIGILL_HANDLER.lock() {
        guard.take()
    } else {
        return Err("Failed to lock ORIGINAL_SIGILL_HANDLER".to_string());
    };

    // Restore the original handler or set to default
    unsafe {
        if let Some(handler) = original_handler {
            if sigaction(SIGILL, &handler, ptr::null_mut()) != 0 {
                return Err("Failed to restore original SIGILL handler".to_string());
            }
            debug!(
                "Restored original SIGILL handler at {:p}",
                handler.sa_sigaction as *const ()
            );
        } else {
            let mut sa: sigaction = mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            sa.sa_flags = 0;
            libc::sigemptyset(&mut sa.sa_mask);

            if sigaction(SIGILL, &sa, ptr::null_mut()) != 0 {
                return Err("Failed to set SIGILL handler to default".to_string());
            }
            debug!("Set SIGILL handler to default (SIG_DFL)");
        }
    }

    info!("SIGILL trap bridge uninstalled successfully");
    Ok(())
}

/// Create an enclave and arm the trap bridge with its exception entry, so
/// prohibited instructions that really execute in-process reach the
/// enclave's dispatcher.
pub fn create_enclave_with_trap_bridge(
    image: &'static EnclaveImage,
    ocalls: OcallTable,
) -> VehResult<Enclave> {
    let enclave = Enclave::create(image, ocalls)?;
    install_trap_bridge(Some(image.exception_entry), true, None)
        .map_err(|_| Status::Unexpected)?;
    Ok(enclave)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Global mutex to ensure signal handler tests run sequentially.
    // Signal dispositions are process-wide and these tests modify shared
    // global state (ORIGINAL_SIGILL_HANDLER, BRIDGE_CONFIG).
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_install_and_uninstall_trap_bridge() {
        let _guard = TEST_MUTEX.lock().unwrap();

        let result = install_trap_bridge(None, false, None);
        assert!(result.is_ok());

        let result = uninstall_trap_bridge();
        assert!(result.is_ok());

        // Uninstalling without installing doesn't crash; the handler just
        // goes back to default.
        let result = uninstall_trap_bridge();
        assert!(result.is_ok());
    }

    #[test]
    fn test_multiple_install_uninstall_cycles() {
        let _guard = TEST_MUTEX.lock().unwrap();

        for i in 0..3 {
            let chain = i % 2 == 0;
            let result = install_trap_bridge(None, chain, None);
            assert!(result.is_ok(), "Failed to install bridge on iteration {i}");

            let result = uninstall_trap_bridge();
            assert!(result.is_ok(), "Failed to uninstall bridge on iteration {i}");
        }
    }

    #[test]
    fn test_trap_bridge_with_callback() {
        let _guard = TEST_MUTEX.lock().unwrap();

        static CALLBACK_CALLED: AtomicUsize = AtomicUsize::new(0);

        fn test_callback(_sig: libc::c_int, _info: *mut siginfo_t, _context: *mut libc::c_void) {
            CALLBACK_CALLED.fetch_add(1, Ordering::SeqCst);
        }

        CALLBACK_CALLED.store(0, Ordering::SeqCst);

        let result = install_trap_bridge(None, false, Some(test_callback));
        assert!(result.is_ok());

        // A raised SIGILL exercises the bridge without a faulting
        // instruction; nothing decodes as prohibited, so only the callback
        // observes it.
        unsafe {
            libc::raise(SIGILL);
        }

        assert!(
            CALLBACK_CALLED.load(Ordering::SeqCst) > 0,
            "Callback was not called"
        );

        let result = uninstall_trap_bridge();
        assert!(result.is_ok());
    }

    #[test]
    fn test_bridge_chaining() {
        let _guard = TEST_MUTEX.lock().unwrap();

        static ORIGINAL_HANDLER_CALLED: AtomicUsize = AtomicUsize::new(0);
        static OUR_CALLBACK_CALLED: AtomicUsize = AtomicUsize::new(0);

        extern "C" fn original_handler(
            sig: libc::c_int,
            _info: *mut siginfo_t,
            _context: *mut libc::c_void,
        ) {
            if sig == SIGILL {
                ORIGINAL_HANDLER_CALLED.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn our_callback(_sig: libc::c_int, _info: *mut siginfo_t, _context: *mut libc::c_void) {
            OUR_CALLBACK_CALLED.fetch_add(1, Ordering::SeqCst);
        }

        ORIGINAL_HANDLER_CALLED.store(0, Ordering::SeqCst);
        OUR_CALLBACK_CALLED.store(0, Ordering::SeqCst);

        // Install original handler
        let mut sa: sigaction = unsafe { mem::zeroed() };
        sa.sa_sigaction = original_handler as usize;
        sa.sa_flags = SA_SIGINFO;
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
            let result = sigaction(SIGILL, &sa, ptr::null_mut());
            assert_eq!(result, 0, "Failed to install original handler");
        }

        // Install the bridge with chaining enabled and a callback
        let result = install_trap_bridge(None, true, Some(our_callback));
        assert!(result.is_ok());

        unsafe {
            libc::raise(SIGILL);
        }

        assert!(
            OUR_CALLBACK_CALLED.load(Ordering::SeqCst) > 0,
            "Our callback was not called"
        );
        assert!(
            ORIGINAL_HANDLER_CALLED.load(Ordering::SeqCst) > 0,
            "Original handler was not chained"
        );

        let our_count = OUR_CALLBACK_CALLED.load(Ordering::SeqCst);
        let orig_count = ORIGINAL_HANDLER_CALLED.load(Ordering::SeqCst);

        let result = uninstall_trap_bridge();
        assert!(result.is_ok());

        // The original handler is restored and handles the signal alone.
        unsafe {
            libc::raise(SIGILL);
        }

        assert_eq!(
            OUR_CALLBACK_CALLED.load(Ordering::SeqCst),
            our_count,
            "Our callback was called after uninstall"
        );
        assert!(
            ORIGINAL_HANDLER_CALLED.load(Ordering::SeqCst) > orig_count,
            "Original handler was not restored"
        );

        // Leave the disposition at default for the rest of the process.
        let mut sa: sigaction = unsafe { mem::zeroed() };
        sa.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
            sigaction(SIGILL, &sa, ptr::null_mut());
        }
    }
}
