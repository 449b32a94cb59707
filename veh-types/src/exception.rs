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

/// General-purpose register snapshot at fault time.
///
/// Field order follows the SGX exception ABI so the snapshot can be copied
/// to and from an `sgx_cpu_context_t`-shaped record verbatim.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

/// Hardware exception vector numbers (x86-64).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Breakpoint = 3,
    BoundRangeExceeded = 5,
    UndefinedOpcode = 6,
    GeneralProtection = 13,
    PageFault = 14,
    FpuError = 16,
    AlignmentCheck = 17,
    SimdError = 19,
}

/// Origin of an exception.
///
/// `Simulated` marks faults raised by the software trap entry when the
/// runtime hosts the enclave in-process; the dispatcher treats them like
/// hardware faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    Hardware,
    Software,
    Simulated,
}

/// Captured context of one in-flight fault.
///
/// Created on fault entry, destroyed on resume or abort; never persisted.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub cpu_context: CpuContext,
    pub vector: ExceptionVector,
    pub exception_type: ExceptionType,
    /// Faulting data address for memory faults; zero otherwise.
    pub faulting_address: u64,
    /// Whether an alternate exception-handler stack was configured for this
    /// dispatch.
    pub handler_stack_requested: bool,
}

impl ExceptionInfo {
    pub fn new(cpu_context: CpuContext, vector: ExceptionVector, exception_type: ExceptionType) -> Self {
        ExceptionInfo {
            cpu_context,
            vector,
            exception_type,
            faulting_address: 0,
            handler_stack_requested: false,
        }
    }
}

/// What a handler in the chain decided about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The fault is handled; resume with the (possibly rewritten) context.
    ContinueExecution,
    /// Not this handler's fault; try the next one in the chain.
    ContinueSearch,
    /// The fault is recognized and unrecoverable; tear the enclave down.
    AbortExecution,
}

/// Final disposition of one dispatched fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler claimed the fault; execution continues from the snapshot.
    Resumed,
    /// No handler claimed the fault (or one demanded abort); the enclave
    /// instance is dead.
    Fatal,
}
