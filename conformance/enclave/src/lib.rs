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

//! Vector-exception conformance enclave.
//!
//! Exercises the trusted runtime's fault dispatch end to end: baseline
//! fault round-trips, CPUID emulation against the captured table, a host
//! callback issued from inside fault handling, and all of it with and
//! without the registered alternate handler stack.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use spin::{Mutex, Once};
use veh_proto::caller::HostCaller;
use veh_proto::server::EnclaveImage;
use veh_proto::{
    EnclaveCall, ReturnCode, SetWasOcallCalled, SigillReply, TestCpuidInGlobalConstructors,
    TestOcallInHandler, TestSigillHandling, TestVectorException,
};
use veh_trts::{
    emulated_cpuid, host_call_in_handler, raise_illegal_instruction, register_exception_handler,
    set_exception_handler_stack, unregister_exception_handler, HandlerId, StackRegion,
};
use veh_types::{
    is_emulated_cpuid_leaf, CpuContext, DispatchOutcome, ExceptionInfo, ExceptionVector,
    HandlerOutcome, Status, VehResult, CPUID_MAX_BASIC, CPUID_MAX_EXTENDED, CPUID_RAX,
    SUPPORTED_CPUID_LEAVES,
};

const HANDLER_STACK_SIZE: usize = 64 * 1024;

#[repr(align(16))]
struct StackArea(UnsafeCell<[u8; HANDLER_STACK_SIZE]>);

// Owned exclusively by the faulting execution context while registered.
unsafe impl Sync for StackArea {}

static HANDLER_STACK: StackArea = StackArea(UnsafeCell::new([0; HANDLER_STACK_SIZE]));

fn handler_stack_region() -> StackRegion {
    StackRegion {
        base: HANDLER_STACK.0.get() as usize,
        size: HANDLER_STACK_SIZE,
    }
}

fn on_handler_stack() -> bool {
    let marker = 0u8;
    handler_stack_region().contains(&marker as *const u8 as usize)
}

fn configure_handler_stack(use_handler_stack: bool) -> bool {
    let region = use_handler_stack.then(handler_stack_region);
    set_exception_handler_stack(region)
}

/// Unregisters on drop, so early returns never leak chain entries.
struct Registration(Option<HandlerId>);

impl Registration {
    fn new(first: bool, handler: veh_trts::ExceptionHandler) -> Option<Registration> {
        register_exception_handler(first, handler)
            .ok()
            .map(|id| Registration(Some(id)))
    }

    fn release(mut self) -> HandlerId {
        self.0.take().expect("registration already released")
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(id) = self.0.take() {
            unregister_exception_handler(id);
        }
    }
}

fn ud_context(site: &'static [u8; 2]) -> CpuContext {
    CpuContext {
        rip: site.as_ptr() as u64,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// enc_test_vector_exception
// ---------------------------------------------------------------------------

static BASIC_SITE: [u8; 2] = [0x0f, 0x0b]; // ud2
static ORDER_SITE: [u8; 2] = [0x0f, 0xb9]; // ud1
static NESTED_SITE: [u8; 2] = [0x0f, 0xff]; // ud0

static BASIC_HITS: AtomicU32 = AtomicU32::new(0);
// 0 = unset, 1 = on the handler stack, 2 = off it
static BASIC_RESIDENCY: AtomicU8 = AtomicU8::new(0);
// 0 = unset, 1 = requested flag was set, 2 = it was not
static BASIC_STACK_REQUESTED: AtomicU8 = AtomicU8::new(0);

fn basic_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip != BASIC_SITE.as_ptr() as u64 {
        return HandlerOutcome::ContinueSearch;
    }
    if info.vector != ExceptionVector::UndefinedOpcode {
        return HandlerOutcome::ContinueSearch;
    }
    BASIC_HITS.fetch_add(1, Ordering::SeqCst);
    BASIC_RESIDENCY.store(if on_handler_stack() { 1 } else { 2 }, Ordering::SeqCst);
    BASIC_STACK_REQUESTED.store(
        if info.handler_stack_requested { 1 } else { 2 },
        Ordering::SeqCst,
    );
    info.cpu_context.rip += BASIC_SITE.len() as u64;
    HandlerOutcome::ContinueExecution
}

static VISIT_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn order_first(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip == ORDER_SITE.as_ptr() as u64 {
        VISIT_ORDER.lock().push("first");
    }
    HandlerOutcome::ContinueSearch
}

fn order_appended(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip == ORDER_SITE.as_ptr() as u64 {
        VISIT_ORDER.lock().push("appended");
    }
    HandlerOutcome::ContinueSearch
}

fn order_claim(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip != ORDER_SITE.as_ptr() as u64 {
        return HandlerOutcome::ContinueSearch;
    }
    VISIT_ORDER.lock().push("claim");
    info.cpu_context.rip += ORDER_SITE.len() as u64;
    HandlerOutcome::ContinueExecution
}

static NESTED_OK: AtomicU8 = AtomicU8::new(0);

fn nesting_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip != NESTED_SITE.as_ptr() as u64 {
        return HandlerOutcome::ContinueSearch;
    }
    // Fault-from-a-fault: the emulation round-trip must work while this
    // dispatch is still in flight.
    match emulated_cpuid(0, 0) {
        Ok(regs) if regs[CPUID_RAX] == CPUID_MAX_BASIC => {
            NESTED_OK.store(1, Ordering::SeqCst)
        }
        _ => NESTED_OK.store(2, Ordering::SeqCst),
    }
    info.cpu_context.rip += NESTED_SITE.len() as u64;
    HandlerOutcome::ContinueExecution
}

fn test_vector_exception(use_handler_stack: bool) -> i32 {
    if !configure_handler_stack(use_handler_stack) {
        return 1;
    }

    // Baseline fault round-trip.
    BASIC_HITS.store(0, Ordering::SeqCst);
    BASIC_RESIDENCY.store(0, Ordering::SeqCst);
    BASIC_STACK_REQUESTED.store(0, Ordering::SeqCst);
    let basic = match Registration::new(false, basic_handler) {
        Some(r) => r,
        None => return 2,
    };
    let mut ctx = ud_context(&BASIC_SITE);
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 3;
    }
    if ctx.rip != BASIC_SITE.as_ptr() as u64 + 2 {
        return 4;
    }
    if BASIC_HITS.load(Ordering::SeqCst) != 1 {
        return 5;
    }
    let expected_residency = if use_handler_stack { 1 } else { 2 };
    if BASIC_RESIDENCY.load(Ordering::SeqCst) != expected_residency {
        return 6;
    }
    let expected_requested = if use_handler_stack { 1 } else { 2 };
    if BASIC_STACK_REQUESTED.load(Ordering::SeqCst) != expected_requested {
        return 7;
    }

    // Chain order: a prepended handler sees the fault before an appended
    // one, regardless of registration time.
    VISIT_ORDER.lock().clear();
    let appended = match Registration::new(false, order_appended) {
        Some(r) => r,
        None => return 2,
    };
    let first = match Registration::new(true, order_first) {
        Some(r) => r,
        None => return 2,
    };
    let claim = match Registration::new(false, order_claim) {
        Some(r) => r,
        None => return 2,
    };
    let mut ctx = ud_context(&ORDER_SITE);
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 3;
    }
    if *VISIT_ORDER.lock() != ["first", "appended", "claim"] {
        return 8;
    }

    // Unregistration edge cases: removing twice fails, order of removal
    // does not matter.
    let first_id = first.release();
    if !unregister_exception_handler(first_id) {
        return 9;
    }
    if unregister_exception_handler(first_id) {
        return 9;
    }
    drop(claim);
    drop(appended);

    // Re-entrant dispatch from inside a handler.
    NESTED_OK.store(0, Ordering::SeqCst);
    let nested = match Registration::new(false, nesting_handler) {
        Some(r) => r,
        None => return 2,
    };
    let mut ctx = ud_context(&NESTED_SITE);
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 3;
    }
    if NESTED_OK.load(Ordering::SeqCst) != 1 {
        return 10;
    }
    drop(nested);
    drop(basic);

    set_exception_handler_stack(None);
    0
}

// ---------------------------------------------------------------------------
// enc_test_ocall_in_handler
// ---------------------------------------------------------------------------

static OCALL_SITE: [u8; 2] = [0x0f, 0x0b];

fn ocall_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip != OCALL_SITE.as_ptr() as u64 {
        return HandlerOutcome::ContinueSearch;
    }
    // Request host work without leaving fault context; a marshalling
    // failure means this fault is not safely resumable.
    match host_call_in_handler(&SetWasOcallCalled) {
        Ok(()) => {
            info.cpu_context.rip += OCALL_SITE.len() as u64;
            HandlerOutcome::ContinueExecution
        }
        Err(_) => HandlerOutcome::ContinueSearch,
    }
}

fn test_ocall_in_handler(use_handler_stack: bool) -> i32 {
    if !configure_handler_stack(use_handler_stack) {
        return 1;
    }
    let reg = match Registration::new(false, ocall_handler) {
        Some(r) => r,
        None => return 2,
    };
    let mut ctx = ud_context(&OCALL_SITE);
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 3;
    }
    drop(reg);

    // Outside fault context the callback path must refuse to run.
    if host_call_in_handler(&SetWasOcallCalled) != Err(Status::InvalidState) {
        return 4;
    }

    set_exception_handler_stack(None);
    0
}

// ---------------------------------------------------------------------------
// enc_test_sigill_handling
// ---------------------------------------------------------------------------

static CPUID_PROBE_SITE: [u8; 2] = [0x0f, 0xa2];
static PROBE_HITS: AtomicU32 = AtomicU32::new(0);

// Catches CPUID faults the built-in emulation declined; proves the
// emulation path never claims what it does not recognize.
fn cpuid_fallback_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
    if info.cpu_context.rip != CPUID_PROBE_SITE.as_ptr() as u64 {
        return HandlerOutcome::ContinueSearch;
    }
    PROBE_HITS.fetch_add(1, Ordering::SeqCst);
    info.cpu_context.rip += CPUID_PROBE_SITE.len() as u64;
    HandlerOutcome::ContinueExecution
}

fn test_sigill_handling(use_handler_stack: bool, table: &mut veh_proto::CpuidDump) -> i32 {
    if !configure_handler_stack(use_handler_stack) {
        return 1;
    }

    for (i, &leaf) in SUPPORTED_CPUID_LEAVES.iter().enumerate() {
        if !is_emulated_cpuid_leaf(leaf) {
            continue;
        }
        match emulated_cpuid(leaf, 0) {
            Ok(regs) => table[i] = regs,
            Err(_) => return 2,
        }
    }

    // Repeated reads return the same captured bytes.
    match (emulated_cpuid(0, 0), emulated_cpuid(0, 0)) {
        (Ok(a), Ok(b)) if a == b => {}
        _ => return 3,
    }

    // Leaves the table does not answer must fall through to the next
    // handler in the chain, with the register state untouched.
    PROBE_HITS.store(0, Ordering::SeqCst);
    let fallback = match Registration::new(false, cpuid_fallback_handler) {
        Some(r) => r,
        None => return 4,
    };
    let mut ctx = ud_context(&CPUID_PROBE_SITE);
    ctx.rax = 0x4242_4242;
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 5;
    }
    if ctx.rax != 0x4242_4242 || ctx.rbx != 0 {
        return 6;
    }
    // Captured but sub-leaf dependent: also declined.
    let mut ctx = ud_context(&CPUID_PROBE_SITE);
    ctx.rax = 4;
    if raise_illegal_instruction(&mut ctx) != DispatchOutcome::Resumed {
        return 5;
    }
    if PROBE_HITS.load(Ordering::SeqCst) != 2 {
        return 7;
    }
    drop(fallback);

    set_exception_handler_stack(None);
    0
}

// ---------------------------------------------------------------------------
// enc_test_cpuid_in_global_constructors
// ---------------------------------------------------------------------------

static CTOR_CPUID: Once<([u32; 4], [u32; 4])> = Once::new();

// Global constructor: queries through the emulation path while the image
// is still being created.
fn capture_cpuid_in_constructor() {
    match (emulated_cpuid(0, 0), emulated_cpuid(0x8000_0000, 0)) {
        (Ok(basic), Ok(extended)) => {
            CTOR_CPUID.call_once(|| (basic, extended));
        }
        _ => log::error!("cpuid emulation unavailable during image construction"),
    }
}

fn test_cpuid_in_global_constructors() -> VehResult<()> {
    let (basic, extended) = CTOR_CPUID.get().ok_or(Status::Unexpected)?;
    if basic[CPUID_RAX] != CPUID_MAX_BASIC || extended[CPUID_RAX] != CPUID_MAX_EXTENDED {
        return Err(Status::Unexpected);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Image plumbing
// ---------------------------------------------------------------------------

fn enclave_init(host: Arc<dyn HostCaller>) -> VehResult<()> {
    veh_trts::runtime_init(host)
}

fn exception_entry(info: &mut ExceptionInfo) -> HandlerOutcome {
    match veh_trts::dispatch_exception(info) {
        DispatchOutcome::Resumed => HandlerOutcome::ContinueExecution,
        DispatchOutcome::Fatal => HandlerOutcome::AbortExecution,
    }
}

fn ecall_test_vector_exception(payload: &[u8]) -> VehResult<Vec<u8>> {
    let req: TestVectorException = veh_proto::decode(payload)?;
    veh_trts::println!(
        "test_vector_exception: use_handler_stack={}",
        req.use_handler_stack
    );
    veh_proto::encode(&ReturnCode(test_vector_exception(req.use_handler_stack)))
}

fn ecall_test_ocall_in_handler(payload: &[u8]) -> VehResult<Vec<u8>> {
    let req: TestOcallInHandler = veh_proto::decode(payload)?;
    veh_trts::println!(
        "test_ocall_in_handler: use_handler_stack={}",
        req.use_handler_stack
    );
    veh_proto::encode(&ReturnCode(test_ocall_in_handler(req.use_handler_stack)))
}

fn ecall_test_sigill_handling(payload: &[u8]) -> VehResult<Vec<u8>> {
    let req: TestSigillHandling = veh_proto::decode(payload)?;
    veh_trts::println!(
        "test_sigill_handling: use_handler_stack={}",
        req.use_handler_stack
    );
    let mut table = veh_proto::CpuidDump::default();
    let ret = test_sigill_handling(req.use_handler_stack, &mut table);
    veh_proto::encode(&SigillReply {
        ret,
        cpuid_table: table,
    })
}

fn ecall_test_cpuid_in_global_constructors(payload: &[u8]) -> VehResult<Vec<u8>> {
    let _req: TestCpuidInGlobalConstructors = veh_proto::decode(payload)?;
    test_cpuid_in_global_constructors()?;
    veh_proto::encode(&())
}

pub static IMAGE: EnclaveImage = EnclaveImage {
    name: "vector_exception",
    init: enclave_init,
    constructors: &[capture_cpuid_in_constructor],
    ecalls: &[
        (TestVectorException::NAME, ecall_test_vector_exception),
        (TestOcallInHandler::NAME, ecall_test_ocall_in_handler),
        (TestSigillHandling::NAME, ecall_test_sigill_handling),
        (
            TestCpuidInGlobalConstructors::NAME,
            ecall_test_cpuid_in_global_constructors,
        ),
    ],
    exception_entry,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use veh_types::cpuid_leaf_index;

    static TEST_MUTEX: StdMutex<()> = StdMutex::new(());

    struct NullHost;

    impl HostCaller for NullHost {
        fn host_call(&self, _name: &str, _payload: &[u8]) -> VehResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn create_image() {
        (IMAGE.init)(Arc::new(NullHost)).unwrap();
        for ctor in IMAGE.constructors {
            ctor();
        }
    }

    #[test]
    fn all_entries_pass_on_both_stacks() {
        let _guard = TEST_MUTEX.lock().unwrap();
        create_image();

        assert!(test_cpuid_in_global_constructors().is_ok());

        let mut tables = Vec::new();
        for use_handler_stack in [false, true] {
            assert_eq!(test_vector_exception(use_handler_stack), 0);
            let mut table = veh_proto::CpuidDump::default();
            assert_eq!(test_sigill_handling(use_handler_stack, &mut table), 0);
            assert_eq!(
                table[cpuid_leaf_index(0).unwrap()][CPUID_RAX],
                CPUID_MAX_BASIC
            );
            tables.push(table);
            assert_eq!(test_ocall_in_handler(use_handler_stack), 0);
        }
        // Stack-path independence: both passes observe the same table.
        assert_eq!(tables[0], tables[1]);
    }

    #[test]
    fn sigill_table_rows_cover_exactly_the_emulated_leaves() {
        let _guard = TEST_MUTEX.lock().unwrap();
        create_image();

        let mut table = veh_proto::CpuidDump::default();
        assert_eq!(test_sigill_handling(false, &mut table), 0);
        for (i, &leaf) in SUPPORTED_CPUID_LEAVES.iter().enumerate() {
            if is_emulated_cpuid_leaf(leaf) {
                // Every emulated row carries the clamped or captured EAX;
                // leaf 0 is a constant we can assert on any machine.
                if leaf == 0 {
                    assert_eq!(table[i][CPUID_RAX], CPUID_MAX_BASIC);
                }
                if leaf == 0x8000_0000 {
                    assert_eq!(table[i][CPUID_RAX], CPUID_MAX_EXTENDED);
                }
            } else {
                assert_eq!(table[i], [0; 4]);
            }
        }
    }
}
