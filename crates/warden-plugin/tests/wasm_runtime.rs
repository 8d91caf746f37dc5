//! End-to-end loads through the Extism runtime with hand-assembled modules.

use std::path::PathBuf;
use std::time::Duration;

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, Module, TypeSection, ValType,
};
use warden_plugin::process::ModuleSource;
use warden_plugin::{
    embed_descriptor, seal, HostConfig, Plugin, PluginMetadata, PluginRegistry, ProcessPlugin,
    SandboxConfig, SandboxLevel, SandboxPolicy, WorkerCommand,
};

const KERNEL: &str = "extism:host/env";

// Type indices.
const RETURNS_I32: u32 = 0;
const ALLOC: u32 = 1;
const STORE_U8: u32 = 2;
const OUTPUT_SET: u32 = 3;

// Function indices: imports first.
const FN_ALLOC: u32 = 0;
const FN_STORE_U8: u32 = 1;
const FN_OUTPUT_SET: u32 = 2;

fn returning(code: i32) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::I32Const(code));
    f.instruction(&Instruction::End);
    f
}

/// Writes `42` to the output buffer.
fn answer() -> Function {
    let mut f = Function::new([(1, ValType::I64)]);
    f.instruction(&Instruction::I64Const(2))
        .instruction(&Instruction::Call(FN_ALLOC))
        .instruction(&Instruction::LocalSet(0));
    for (offset, byte) in [(0i64, b'4'), (1, b'2')] {
        f.instruction(&Instruction::LocalGet(0))
            .instruction(&Instruction::I64Const(offset))
            .instruction(&Instruction::I64Add)
            .instruction(&Instruction::I32Const(i32::from(byte)))
            .instruction(&Instruction::Call(FN_STORE_U8));
    }
    f.instruction(&Instruction::LocalGet(0))
        .instruction(&Instruction::I64Const(2))
        .instruction(&Instruction::Call(FN_OUTPUT_SET))
        .instruction(&Instruction::I32Const(0))
        .instruction(&Instruction::End);
    f
}

fn spin() -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::Loop(BlockType::Empty))
        .instruction(&Instruction::Br(0))
        .instruction(&Instruction::End)
        .instruction(&Instruction::I32Const(0))
        .instruction(&Instruction::End);
    f
}

/// A plugin module speaking the host contract.
fn plugin_module(initialize_code: i32) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]);
    types.ty().function([ValType::I64], [ValType::I64]);
    types.ty().function([ValType::I64, ValType::I32], []);
    types.ty().function([ValType::I64, ValType::I64], []);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import(KERNEL, "alloc", EntityType::Function(ALLOC));
    imports.import(KERNEL, "store_u8", EntityType::Function(STORE_U8));
    imports.import(KERNEL, "output_set", EntityType::Function(OUTPUT_SET));
    module.section(&imports);

    let bodies: Vec<(&str, Function)> = vec![
        ("warden_construct", returning(0)),
        ("warden_destroy", returning(0)),
        ("warden_initialize", returning(initialize_code)),
        ("op_answer", answer()),
        ("op_silent", returning(0)),
        ("op_fail", returning(1)),
        ("op_spin", spin()),
    ];

    let mut functions = FunctionSection::new();
    for _ in &bodies {
        functions.function(RETURNS_I32);
    }
    module.section(&functions);

    let mut exports = ExportSection::new();
    for (i, (name, _)) in bodies.iter().enumerate() {
        exports.export(name, ExportKind::Func, FN_OUTPUT_SET + 1 + i as u32);
    }
    module.section(&exports);

    let mut code = CodeSection::new();
    for (_, body) in &bodies {
        code.function(body);
    }
    module.section(&code);

    module.finish()
}

const DESCRIPTOR: &str = "[plugin]\nname = \"answer\"\nversion = \"0.3.0\"\napi_version = \"^1.0\"\n";

fn worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_warden-worker"))
}

struct Fixture {
    registry: PluginRegistry,
    path: PathBuf,
    digest: String,
    size: u64,
    _dir: tempfile::TempDir,
}

fn fixture(initialize_code: i32) -> Fixture {
    fixture_with(initialize_code, HostConfig::default())
}

fn fixture_with(initialize_code: i32, config: HostConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let module = embed_descriptor(&plugin_module(initialize_code), DESCRIPTOR).unwrap();
    let sealed = seal(&module).unwrap();
    let path = dir.path().join("answer.wasm");
    std::fs::write(&path, &sealed.bytes).unwrap();

    let registry = PluginRegistry::new(config).unwrap();
    registry.trust_digest(&sealed.digest, None).unwrap();

    Fixture {
        registry,
        path,
        digest: sealed.digest,
        size: sealed.bytes.len() as u64,
        _dir: dir,
    }
}

fn with_worker() -> HostConfig {
    let mut config = HostConfig::default();
    config.sandbox.worker = Some(worker());
    config
}

#[test]
fn test_wasm_plugin_round_trip() {
    let f = fixture(0);
    let metadata = f
        .registry
        .try_load_plugin(&f.path, SandboxLevel::File)
        .unwrap();
    assert_eq!(metadata.version, "0.3.0");

    let registry = &f.registry;
    assert_eq!(
        registry.execute_plugin_operation("answer", "answer", "{}"),
        Some("42".to_string())
    );
    assert_eq!(
        registry.execute_plugin_operation("answer", "silent", "{}"),
        Some("null".to_string())
    );
    assert_eq!(registry.execute_plugin_operation("answer", "fail", "{}"), None);
    assert_eq!(registry.execute_plugin_operation("answer", "missing", "{}"), None);

    assert!(registry.unload_plugin("answer"));
    assert_eq!(registry.active_sandboxes(), 0);
}

#[test]
fn test_runaway_operation_is_stopped() {
    let f = fixture(0);
    f.registry
        .try_load_plugin(&f.path, SandboxLevel::File)
        .unwrap();

    assert_eq!(f.registry.execute_plugin_operation("answer", "spin", "{}"), None);
    assert_eq!(
        f.registry.execute_plugin_operation("answer", "answer", "{}"),
        Some("42".to_string())
    );
}

#[test]
fn test_failing_initialize_rejects_load() {
    let f = fixture(1);
    assert!(!f.registry.load_plugin(&f.path, SandboxLevel::File));
    assert!(f.registry.get_loaded_plugins().is_empty());
    assert_eq!(f.registry.active_sandboxes(), 0);
}

#[test]
fn test_process_level_wasm_plugin() {
    let f = fixture_with(0, with_worker());
    f.registry
        .try_load_plugin(&f.path, SandboxLevel::Process)
        .unwrap();

    assert_eq!(
        f.registry.execute_plugin_operation("answer", "answer", "[]"),
        Some("42".to_string())
    );
    assert_eq!(f.registry.execute_plugin_operation("answer", "fail", "{}"), None);
    assert_eq!(f.registry.execute_plugin_operation("answer", "spin", "{}"), None);
    assert_eq!(
        f.registry.execute_plugin_operation("answer", "silent", "{}"),
        Some("null".to_string())
    );
    f.registry.reset();
    assert!(!f.registry.is_plugin_loaded("answer"));
    assert_eq!(f.registry.active_sandboxes(), 0);
}

#[test]
fn test_failing_initialize_in_worker_process() {
    let f = fixture_with(1, with_worker());
    assert!(!f.registry.load_plugin(&f.path, SandboxLevel::Full));
    assert!(f.registry.get_loaded_plugins().is_empty());
    assert_eq!(f.registry.active_sandboxes(), 0);
}

#[test]
fn test_worker_runs_in_separate_process() {
    let f = fixture(0);
    let policy = SandboxPolicy::for_level(SandboxLevel::Process, &SandboxConfig::default());
    let source = ModuleSource {
        path: f.path.clone(),
        digest: f.digest.clone(),
        size: f.size,
    };

    let mut plugin = ProcessPlugin::spawn(
        &worker(),
        source,
        &policy,
        PluginMetadata::new("answer", "0.3.0", "^1.0"),
        Duration::from_secs(10),
    )
    .unwrap();

    assert_ne!(plugin.pid(), std::process::id());
    assert!(plugin.initialize());
    assert_eq!(
        plugin.execute_operation("answer", "{}").as_deref(),
        Some("42")
    );
    plugin.shutdown();
}

#[test]
fn test_worker_refuses_swapped_module() {
    let f = fixture(0);
    // Replace the verified file with a different, validly sealed module.
    let other = embed_descriptor(&plugin_module(1), DESCRIPTOR).unwrap();
    std::fs::write(&f.path, seal(&other).unwrap().bytes).unwrap();

    let policy = SandboxPolicy::for_level(SandboxLevel::Process, &SandboxConfig::default());
    let err = ProcessPlugin::spawn(
        &worker(),
        ModuleSource {
            path: f.path.clone(),
            digest: f.digest.clone(),
            size: f.size,
        },
        &policy,
        PluginMetadata::new("answer", "0.3.0", "^1.0"),
        Duration::from_secs(10),
    )
    .unwrap_err();
    assert!(err.to_string().contains("signature mismatch"), "{err}");
}

#[test]
fn test_image_without_entry_points_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let module = embed_descriptor(&Module::new().finish(), DESCRIPTOR).unwrap();
    let sealed = seal(&module).unwrap();
    let path = dir.path().join("empty.wasm");
    std::fs::write(&path, &sealed.bytes).unwrap();

    let registry = PluginRegistry::new(HostConfig::default()).unwrap();
    registry.trust_digest(&sealed.digest, None).unwrap();

    let err = registry
        .try_load_plugin(&path, SandboxLevel::File)
        .unwrap_err();
    assert!(matches!(err, warden_plugin::PluginError::MissingSymbol { .. }));
    assert_eq!(registry.active_sandboxes(), 0);
}
