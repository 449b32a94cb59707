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

//! Conformance driver for the vector-exception enclave.
//!
//! Exit codes: 0 on success, 1 on usage error, 2 when the execution mode
//! is unsupported; any assertion failure aborts after all mismatches have
//! been reported.

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use vector_exception_enclave::IMAGE;
use veh_proto::{
    CpuidDump, PrintString, ReturnCode, SetWasOcallCalled, TestCpuidInGlobalConstructors,
    TestOcallInHandler, TestSigillHandling, TestVectorException,
};
use veh_types::{
    is_emulated_cpuid_leaf, CPUID_MAX_BASIC, CPUID_MAX_EXTENDED, CPUID_RAX, CPUID_RBX,
    CPUID_REG_COUNT, SUPPORTED_CPUID_LEAVES,
};
use veh_urts::{Enclave, OcallTable};

const SKIP_RETURN_CODE: i32 = 2;

static WAS_OCALL_CALLED: AtomicBool = AtomicBool::new(false);
static FAILURES: AtomicU32 = AtomicU32::new(0);

// Fatal: report the failing operation and abort immediately.
macro_rules! put_err {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        std::process::abort();
    }};
}

// Semantic mismatch: report it, keep going, fail the run at the end.
macro_rules! check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            eprintln!($($arg)*);
            FAILURES.fetch_add(1, Ordering::SeqCst);
        }
    };
}

#[cfg(target_arch = "x86_64")]
fn host_cpuid(leaf: u32) -> [u32; CPUID_REG_COUNT] {
    // SAFETY: only reached on x86-64, where CPUID is always available.
    let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, 0) };
    [r.eax, r.ebx, r.ecx, r.edx]
}

#[cfg(not(target_arch = "x86_64"))]
fn host_cpuid(_leaf: u32) -> [u32; CPUID_REG_COUNT] {
    unreachable!("the harness skips before sampling on non-x86-64 hosts")
}

fn test_vector_exception(enclave: &Enclave, use_handler_stack: bool) {
    let ReturnCode(ret) = match enclave.ecall(&TestVectorException { use_handler_stack }) {
        Ok(reply) => reply,
        Err(status) => put_err!(
            "enc_test_vector_exception() failed: result={}",
            status.as_str()
        ),
    };

    if ret != 0 {
        put_err!("enc_test_vector_exception failed ret={ret}");
    }
}

fn test_ocall_in_handler(enclave: &Enclave, use_handler_stack: bool) {
    let ReturnCode(ret) = match enclave.ecall(&TestOcallInHandler { use_handler_stack }) {
        Ok(reply) => reply,
        Err(status) => put_err!(
            "enc_test_ocall_in_handler() failed: result={}",
            status.as_str()
        ),
    };

    check!(ret == 0, "enc_test_ocall_in_handler failed ret={ret}");
    check!(
        WAS_OCALL_CALLED.load(Ordering::SeqCst),
        "host_set_was_ocall_called was not invoked from the handler"
    );
    WAS_OCALL_CALLED.store(false, Ordering::SeqCst);
}

fn test_sigill_handling(enclave: &Enclave, use_handler_stack: bool) -> CpuidDump {
    let reply = match enclave.ecall(&TestSigillHandling { use_handler_stack }) {
        Ok(reply) => reply,
        Err(status) => put_err!(
            "enc_test_sigill_handling() failed: result={}",
            status.as_str()
        ),
    };

    if reply.ret != 0 {
        put_err!("enc_test_sigill_handling failed ret={}", reply.ret);
    }

    // Verify that the enclave cached CPUID values match the host's.
    // First make sure the values being tested exist on this machine at all.
    let host_max_basic = host_cpuid(0)[CPUID_RAX];
    if host_max_basic < CPUID_MAX_BASIC {
        put_err!(
            "Test machine does not support CPUID leaf {:#x} expected by test_sigill_handling",
            CPUID_MAX_BASIC
        );
    }

    for (i, &leaf) in SUPPORTED_CPUID_LEAVES.iter().enumerate() {
        if !is_emulated_cpuid_leaf(leaf) {
            continue;
        }

        let host = host_cpuid(leaf);
        for j in 0..CPUID_REG_COUNT {
            let enclave_val = reply.cpuid_table[i][j];
            if leaf == 0 && j == CPUID_RAX {
                // The enclave clamps this to the highest emulated leaf.
                check!(
                    enclave_val == CPUID_MAX_BASIC,
                    "cpuid leaf {leaf:#x} reg {j}: expected {CPUID_MAX_BASIC:#x}, enclave reported {enclave_val:#x}"
                );
            } else if leaf == 1 && j == CPUID_RBX {
                // The highest 8 bits carry the current processor id; the
                // thread can be scheduled elsewhere between samples, and
                // the enclave reports a cached value anyway.
                check!(
                    (host[j] & 0x00ff_ffff) == (enclave_val & 0x00ff_ffff),
                    "cpuid leaf {leaf:#x} reg {j}: host {:#x}, enclave {enclave_val:#x} (low 24 bits differ)",
                    host[j]
                );
            } else if leaf == 0x8000_0000 && j == CPUID_RAX {
                // Clamped to the highest emulated extended leaf.
                check!(
                    enclave_val == CPUID_MAX_EXTENDED,
                    "cpuid leaf {leaf:#x} reg {j}: expected {CPUID_MAX_EXTENDED:#x}, enclave reported {enclave_val:#x}"
                );
            } else {
                check!(
                    host[j] == enclave_val,
                    "cpuid leaf {leaf:#x} reg {j}: host {:#x}, enclave {enclave_val:#x}",
                    host[j]
                );
            }
        }
    }

    reply.cpuid_table
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("veh_urts=debug".parse().unwrap()),
        )
        .init();

    if env::args().count() != 1 {
        eprintln!("Usage: vector_exception");
        process::exit(1);
    }

    println!("=== This program is used to test basic vector exception functionalities.");

    if !cfg!(target_arch = "x86_64") {
        println!("=== Skipped unsupported test on this architecture (vector_exception)");
        process::exit(SKIP_RETURN_CODE);
    }

    let mut ocalls = OcallTable::new();
    ocalls.register(|_: SetWasOcallCalled| {
        WAS_OCALL_CALLED.store(true, Ordering::SeqCst);
        Ok(())
    });
    ocalls.register(|call: PrintString| {
        print!("{}", call.s);
        Ok(())
    });

    let enclave = match Enclave::create(&IMAGE, ocalls) {
        Ok(enclave) => enclave,
        Err(status) => put_err!("Enclave::create(): result={}", status.as_str()),
    };

    if let Err(status) = enclave.ecall(&TestCpuidInGlobalConstructors) {
        put_err!(
            "enc_test_cpuid_in_global_constructors() failed: result={}",
            status.as_str()
        );
    }

    /* Test with the default behavior (handlers run on the faulting stack) */
    test_vector_exception(&enclave, false);
    let table_default = test_sigill_handling(&enclave, false);
    test_ocall_in_handler(&enclave, false);

    /* Test with the registered exception handler stack */
    test_vector_exception(&enclave, true);
    let table_with_stack = test_sigill_handling(&enclave, true);
    test_ocall_in_handler(&enclave, true);

    check!(
        table_default == table_with_stack,
        "cpuid table differs between handler stack configurations"
    );

    enclave.destroy();

    let failures = FAILURES.load(Ordering::SeqCst);
    if failures != 0 {
        eprintln!("[-] {failures} check(s) failed (vector_exception)");
        process::abort();
    }

    println!("=== passed all tests (vector_exception)");
}
