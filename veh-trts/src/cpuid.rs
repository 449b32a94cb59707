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

//! CPUID capture and emulation.
//!
//! The real instruction runs exactly once per leaf, during runtime init.
//! Afterwards every CPUID fault inside the instance is answered from the
//! captured table, or declined if the leaf is not one the runtime emulates.

use spin::Once;
use veh_types::{
    cpuid_leaf_index, is_emulated_cpuid_leaf, CpuContext, DispatchOutcome, ExceptionInfo,
    ExceptionVector, HandlerOutcome, Status, VehResult, CPUID_LEAF_COUNT, CPUID_MAX_BASIC,
    CPUID_MAX_EXTENDED, CPUID_OPCODE, CPUID_RAX, CPUID_RBX, CPUID_RCX, CPUID_RDX,
    CPUID_REG_COUNT, SUPPORTED_CPUID_LEAVES,
};

/// Length of the bare CPUID encoding; emulation skips past it on resume.
pub const CPUID_INSTRUCTION_LEN: u64 = 2;

/// One captured architecture-query result. Immutable once captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidEntry {
    pub leaf: u32,
    pub regs: [u32; CPUID_REG_COUNT],
}

struct CpuidTable {
    entries: [CpuidEntry; CPUID_LEAF_COUNT],
}

impl CpuidTable {
    fn capture() -> Self {
        let mut entries = [CpuidEntry {
            leaf: 0,
            regs: [0; CPUID_REG_COUNT],
        }; CPUID_LEAF_COUNT];
        for (i, &leaf) in SUPPORTED_CPUID_LEAVES.iter().enumerate() {
            entries[i] = CpuidEntry {
                leaf,
                regs: query_cpuid(leaf),
            };
        }
        // The instance reports only the leaves it emulates, so the two
        // max-leaf registers are clamped rather than passed through.
        entries[0].regs[CPUID_RAX] = CPUID_MAX_BASIC;
        if let Some(i) = cpuid_leaf_index(0x8000_0000) {
            entries[i].regs[CPUID_RAX] = CPUID_MAX_EXTENDED;
        }
        CpuidTable { entries }
    }

    fn lookup(&self, leaf: u32) -> Option<&CpuidEntry> {
        if !is_emulated_cpuid_leaf(leaf) {
            return None;
        }
        self.entries.iter().find(|e| e.leaf == leaf)
    }
}

static CPUID_TABLE: Once<CpuidTable> = Once::new();

/// Capture the table. One-shot: later calls are no-ops, so the values
/// observed by any reader are the ones from the first, privileged init.
pub fn init_cpuid_table() {
    CPUID_TABLE.call_once(CpuidTable::capture);
}

/// Read a captured entry. `None` means "not emulated, do not intercept" —
/// for leaves outside the supported set, for leaf 4 (sub-leaf dependent),
/// and before init.
pub fn cpuid_lookup(leaf: u32) -> Option<&'static CpuidEntry> {
    CPUID_TABLE.get()?.lookup(leaf)
}

// The one legitimate execution point of the real instruction.
#[cfg(target_arch = "x86_64")]
fn query_cpuid(leaf: u32) -> [u32; CPUID_REG_COUNT] {
    // SAFETY: CPUID is available on every x86-64 processor this runtime
    // hosts on; init runs before any fault can be raised against the table.
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, 0) };
    [r.eax, r.ebx, r.ecx, r.edx]
}

#[cfg(not(target_arch = "x86_64"))]
fn query_cpuid(_leaf: u32) -> [u32; CPUID_REG_COUNT] {
    [0; CPUID_REG_COUNT]
}

/// What the classifier made of a faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Cpuid { leaf: u32, subleaf: u32 },
    Unsupported,
}

/// Decode the faulting instruction just enough to recognize the one opcode
/// this runtime emulates.
///
/// Deliberately narrow: only the bare two-byte CPUID encoding on an
/// undefined-opcode fault classifies as `Cpuid`; anything else, including
/// prefixed forms, is left for the rest of the chain.
pub fn classify(info: &ExceptionInfo) -> Classified {
    if info.vector != ExceptionVector::UndefinedOpcode {
        return Classified::Unsupported;
    }
    let rip = info.cpu_context.rip;
    if rip == 0 {
        return Classified::Unsupported;
    }
    // SAFETY: rip of a dispatched fault points at the live encoding of the
    // faulting instruction; two bytes are readable there.
    let opcode = unsafe { core::ptr::read_unaligned(rip as *const u16) };
    if opcode != CPUID_OPCODE {
        return Classified::Unsupported;
    }
    Classified::Cpuid {
        leaf: info.cpu_context.rax as u32,
        subleaf: info.cpu_context.rcx as u32,
    }
}

/// Built-in chain handler: answer emulated CPUID faults from the table.
///
/// Writes the four result registers into the captured context and advances
/// past the instruction (skip-and-continue, not retry). Declines everything
/// it does not positively recognize.
pub fn cpuid_exception_handler(info: &mut ExceptionInfo) -> HandlerOutcome {
    let (leaf, subleaf) = match classify(info) {
        Classified::Cpuid { leaf, subleaf } => (leaf, subleaf),
        Classified::Unsupported => return HandlerOutcome::ContinueSearch,
    };
    // Only sub-leaf 0 is captured; anything else is not ours to answer.
    if subleaf != 0 {
        return HandlerOutcome::ContinueSearch;
    }
    let entry = match cpuid_lookup(leaf) {
        Some(e) => e,
        None => return HandlerOutcome::ContinueSearch,
    };
    let ctx = &mut info.cpu_context;
    ctx.rax = entry.regs[CPUID_RAX] as u64;
    ctx.rbx = entry.regs[CPUID_RBX] as u64;
    ctx.rcx = entry.regs[CPUID_RCX] as u64;
    ctx.rdx = entry.regs[CPUID_RDX] as u64;
    ctx.rip += CPUID_INSTRUCTION_LEN;
    HandlerOutcome::ContinueExecution
}

// Trap site for in-enclave CPUID requests: the faulting encoding the
// classifier reads.
static CPUID_TRAP_SITE: [u8; 2] = [0x0f, 0xa2];

/// Query CPUID through the fault path, as enclave code would by executing
/// the instruction.
pub fn emulated_cpuid(leaf: u32, subleaf: u32) -> VehResult<[u32; CPUID_REG_COUNT]> {
    let mut ctx = CpuContext {
        rax: leaf as u64,
        rcx: subleaf as u64,
        rip: CPUID_TRAP_SITE.as_ptr() as u64,
        ..Default::default()
    };
    match crate::veh::raise_illegal_instruction(&mut ctx) {
        DispatchOutcome::Resumed => Ok([
            ctx.rax as u32,
            ctx.rbx as u32,
            ctx.rcx as u32,
            ctx.rdx as u32,
        ]),
        DispatchOutcome::Fatal => Err(Status::EnclaveCrashed),
    }
}
