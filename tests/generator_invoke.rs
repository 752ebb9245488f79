// Generator invocation end to end, against hand-written WAT generators.
use std::collections::BTreeSet;

use bitseed::api::{
    AbiConvention, DeployArg, ErrorKind, Generator, GeneratorInvoker, HostConfig, HostRuntime,
    InvocationRequest, WasmGenerator,
};

const HELLO_ALLOC: &str = include_str!("fixtures/hello_alloc.wat");
const HELLO_STACK: &str = include_str!("fixtures/hello_stack.wat");
const FNV_RANGE: &str = include_str!("fixtures/fnv_range.wat");

const TRAPPING: &str = r#"
(module
  (import "env" "abort" (func $abort))
  (memory (export "memory") 1)
  (func (export "malloc") (param i32) (result i32) (i32.const 64))
  (func (export "free") (param i32))
  (func (export "inscribe_generate") (param i32 i32 i32) (result i32)
    (call $abort)
    (i32.const 0)))
"#;

const NO_ALLOCATOR: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "inscribe_generate") (param i32 i32 i32) (result i32) (i32.const 0)))
"#;

const SCALAR_OUTPUT: &str = r#"
(module
  (memory (export "memory") 1)
  (global $sp (mut i32) (i32.const 65536))
  (func (export "stackSave") (result i32) (global.get $sp))
  (func (export "stackRestore") (param i32) (global.set $sp (local.get 0)))
  (func (export "stackAlloc") (param $size i32) (result i32)
    (global.set $sp (i32.sub (global.get $sp) (local.get $size)))
    (global.get $sp))
  (func (export "inscribe_generate") (param i32) (result i32) (i32.const 256))
  (data (i32.const 256) "\00\00\00\01\01"))
"#;

fn hello_request() -> InvocationRequest {
    InvocationRequest::from_json_args(
        &[r#"{"level1":{"type":"range","data":{"min":1,"max":1000}}}"#],
        "random-seed",
        "user-input",
    )
    .expect("request")
}

fn assert_hello_record(generator: &WasmGenerator) {
    let record = generator
        .inscribe_generate(&hello_request())
        .expect("generate");
    assert_eq!(record.op, "mint");
    assert_eq!(record.amount, 1000);
    assert_eq!(record.attributes, None);
    let content = record.content.as_ref().expect("content");
    assert_eq!(content.content_type, "text/plain");
    assert_eq!(content.content, b"Hello, World!");
    assert_eq!(content.content_len(), 13);

    let json = record.to_json();
    assert_eq!(json["content"]["content"], "Hello, World!");
    assert_eq!(json["content"]["content_len"], 13);
    assert!(json["attributes"].is_null());
}

#[test]
fn hello_world_alloc_free_convention() {
    let generator = WasmGenerator::new(HELLO_ALLOC.as_bytes()).expect("generator");
    let runtime = generator.invoker().runtime();
    let instance = runtime
        .instantiate(generator.invoker().module())
        .expect("instantiate");
    assert_eq!(instance.convention(), AbiConvention::AllocFree);
    assert_hello_record(&generator);
}

#[test]
fn hello_world_stack_scoped_convention() {
    let generator = WasmGenerator::new(HELLO_STACK.as_bytes()).expect("generator");
    let runtime = generator.invoker().runtime();
    let instance = runtime
        .instantiate(generator.invoker().module())
        .expect("instantiate");
    assert_eq!(instance.convention(), AbiConvention::StackScoped);
    assert_hello_record(&generator);
}

#[test]
fn both_conventions_agree_on_canonical_bytes() {
    let alloc = WasmGenerator::new(HELLO_ALLOC.as_bytes()).expect("alloc");
    let stack = WasmGenerator::new(HELLO_STACK.as_bytes()).expect("stack");
    let request = hello_request().with_tick("hello");
    let from_alloc = alloc.inscribe_generate(&request).expect("alloc record");
    let from_stack = stack.inscribe_generate(&request).expect("stack record");
    assert_eq!(from_alloc.tick, "hello");
    assert_eq!(
        from_alloc.to_cbor_bytes().expect("cbor"),
        from_stack.to_cbor_bytes().expect("cbor")
    );
    assert!(stack.inscribe_verify(&request, &from_alloc).expect("verify"));
}

#[test]
fn hello_amount_follows_the_declared_max() {
    let alloc = WasmGenerator::new(HELLO_ALLOC.as_bytes()).expect("alloc");
    let stack = WasmGenerator::new(HELLO_STACK.as_bytes()).expect("stack");
    for (max, expected) in [(500, 500), (17, 17), (5000, 1000)] {
        let args = vec![DeployArg::range("level1", 1, max).expect("arg")];
        let request = InvocationRequest::new(args, "random-seed", "user-input");
        let from_alloc = alloc.inscribe_generate(&request).expect("alloc record");
        let from_stack = stack.inscribe_generate(&request).expect("stack record");
        assert_eq!(from_alloc.amount, expected, "alloc, max {max}");
        assert_eq!(from_stack.amount, expected, "stack, max {max}");
        assert_eq!(from_alloc, from_stack);
    }
}

#[test]
fn seeded_amount_stays_in_the_declared_range() {
    let invoker = GeneratorInvoker::from_bytecode(FNV_RANGE.as_bytes()).expect("invoker");
    let args = vec![DeployArg::range("height", 10, 20).expect("arg")];
    let mut seen = BTreeSet::new();
    for seed in 0..40 {
        let request = InvocationRequest::new(args.clone(), format!("0x{seed:02x}"), "");
        let record = invoker.invoke(&request).expect("invoke");
        assert!((10..=20).contains(&record.amount), "amount {}", record.amount);
        seen.insert(record.amount);
    }
    assert!(seen.len() > 3, "amounts should spread over the range: {seen:?}");
}

#[test]
fn seeded_amount_is_deterministic_and_in_range() {
    let invoker = GeneratorInvoker::from_bytecode(FNV_RANGE.as_bytes()).expect("invoker");
    let args = vec![DeployArg::range("height", 1, 1000).expect("arg")];
    let mut seen = BTreeSet::new();
    for seed in ["0x01", "0x02", "0x03", "0x04", "0x05", "0x06"] {
        let request = InvocationRequest::new(args.clone(), seed, "");
        let first = invoker.invoke(&request).expect("first");
        let second = invoker.invoke(&request).expect("second");
        assert_eq!(first, second, "seed {seed} must regenerate identically");
        assert!((1..=1000).contains(&first.amount), "amount {}", first.amount);
        assert!(first.content.is_none());
        seen.insert(first.amount);
    }
    assert!(seen.len() > 1, "amount should depend on the seed");
}

#[test]
fn verify_rejects_a_tampered_record() {
    let generator = WasmGenerator::new(FNV_RANGE.as_bytes()).expect("generator");
    let request = InvocationRequest::new(Vec::new(), "0xfeed", "alice");
    let mut record = generator.inscribe_generate(&request).expect("generate");
    assert!(generator.inscribe_verify(&request, &record).expect("verify"));
    record.amount = if record.amount == 1000 { 1 } else { record.amount + 1 };
    assert!(!generator.inscribe_verify(&request, &record).expect("verify"));
}

#[test]
fn guest_abort_is_an_execution_error() {
    let generator = WasmGenerator::new(TRAPPING.as_bytes()).expect("generator");
    let err = generator
        .inscribe_generate(&hello_request())
        .err()
        .expect("must trap");
    assert_eq!(err.kind(), ErrorKind::GeneratorExecution);
    // A fresh instance per call: the next call fails the same way, not worse.
    let again = generator
        .inscribe_generate(&hello_request())
        .err()
        .expect("must trap again");
    assert_eq!(again.kind(), ErrorKind::GeneratorExecution);
}

#[test]
fn module_without_allocator_is_unsupported() {
    let err = WasmGenerator::new(NO_ALLOCATOR.as_bytes())
        .and_then(|generator| generator.inscribe_generate(&hello_request()))
        .err()
        .expect("must fail");
    assert_eq!(err.kind(), ErrorKind::UnsupportedAbi);
}

#[test]
fn scalar_output_is_invalid_with_raw_bytes() {
    let generator = WasmGenerator::new(SCALAR_OUTPUT.as_bytes()).expect("generator");
    let err = generator
        .inscribe_generate(&InvocationRequest::default())
        .err()
        .expect("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidGeneratorOutput);
    assert_eq!(err.raw(), Some(&[0x01u8][..]));
}

#[test]
fn memory_ceiling_below_initial_memory_is_out_of_memory() {
    let runtime = HostRuntime::new(HostConfig::new().with_max_memory_bytes(64 * 1024))
        .expect("runtime");
    let err = WasmGenerator::with_runtime(runtime, HELLO_ALLOC.as_bytes())
        .and_then(|generator| generator.inscribe_generate(&hello_request()))
        .err()
        .expect("must fail");
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn garbage_bytecode_is_a_module_error() {
    let err = WasmGenerator::new(b"\0asm\x01\0\0\0\xff")
        .err()
        .expect("must fail");
    assert_eq!(err.kind(), ErrorKind::Module);
}
