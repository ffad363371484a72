//! Recompiled shader binaries replace the programs bound to live components

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hotswap_engine::component;
use hotswap_engine::gfx::{
    Backend, GraphicsDevice, HeadlessDevice, ProgramHandle, ShaderHandle, ShaderProgramSpec,
};
use hotswap_engine::hot_reload::ShaderEvent;
use hotswap_engine::{EngineResult, Entity, Host, HostConfig, PackageRegistrar, StaticPackage};
use tempfile::TempDir;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct ForwardMaterial {
    program: ProgramHandle,
    shadow_program: ProgramHandle,
    tint: u32,
}

component!(ForwardMaterial as "render::ForwardMaterial" {
    program: ProgramHandle => ShaderProgramSpec::graphics("vs_forward", "fs_forward"),
    shadow_program: ProgramHandle => ShaderProgramSpec::graphics("vs_shadow", "fs_shadow"),
    tint: u32,
});

fn register(registrar: &mut PackageRegistrar) {
    registrar.component::<ForwardMaterial>();
}

type DeviceLog = Arc<Mutex<Vec<String>>>;

/// Headless device that records program creation and destruction
struct RecordingDevice {
    inner: HeadlessDevice,
    log: DeviceLog,
}

impl GraphicsDevice for RecordingDevice {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    fn create_shader(&mut self, name: &str, bytes: &[u8]) -> EngineResult<ShaderHandle> {
        self.inner.create_shader(name, bytes)
    }

    fn create_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> EngineResult<ProgramHandle> {
        let program = self.inner.create_program(vertex, fragment)?;
        self.log.lock().unwrap().push(format!("create {}", program.0));
        Ok(program)
    }

    fn create_compute_program(&mut self, compute: ShaderHandle) -> EngineResult<ProgramHandle> {
        let program = self.inner.create_compute_program(compute)?;
        self.log.lock().unwrap().push(format!("create {}", program.0));
        Ok(program)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.inner.destroy_shader(shader);
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.log.lock().unwrap().push(format!("destroy {}", program.0));
        self.inner.destroy_program(program);
    }
}

fn write_binary(root: &Path, name: &str, bytes: &[u8]) {
    let dir = root.join(Backend::Vulkan.shader_dir());
    fs::create_dir_all(&dir).expect("create backend dir");
    fs::write(dir.join(format!("{}.bin", name)), bytes).expect("write binary");
}

struct Fixture {
    _shaders: TempDir,
    root: std::path::PathBuf,
    host: Host<StaticPackage>,
    log: DeviceLog,
    entities: Vec<Entity>,
}

fn fixture() -> Fixture {
    let shaders = TempDir::new().expect("temp dir");
    let root = shaders.path().to_path_buf();
    for name in ["vs_forward", "fs_forward", "vs_shadow", "fs_shadow"] {
        write_binary(&root, name, name.as_bytes());
    }

    let mut config = HostConfig::default();
    config.hot_reload.enabled = false;
    config.graphics.backend = Backend::Vulkan;
    config.graphics.shader_root = Some(root.clone());

    let log = DeviceLog::default();
    let device = Box::new(RecordingDevice {
        inner: HeadlessDevice::new(Backend::Vulkan),
        log: log.clone(),
    });
    let mut host = Host::new(config, StaticPackage::new("render", register), device);
    host.init().expect("init");

    let mut entities = Vec::new();
    for tint in [0xff0000ff, 0x00ff00ff] {
        let entity = host
            .world_mut()
            .spawn()
            .with(ForwardMaterial {
                program: ProgramHandle::INVALID,
                shadow_program: ProgramHandle::INVALID,
                tint,
            })
            .build()
            .expect("spawn");
        let (swap, world, device) = host.shader_swap_mut();
        let created = swap
            .load_shaders_for::<ForwardMaterial>(world, device, entity)
            .expect("load shaders");
        assert_eq!(created, 2);
        entities.push(entity);
    }
    log.lock().unwrap().clear();

    Fixture {
        _shaders: shaders,
        root,
        host,
        log,
        entities,
    }
}

fn material(host: &Host<StaticPackage>, entity: Entity) -> ForwardMaterial {
    host.world().get::<ForwardMaterial>(entity).expect("material")
}

#[test]
fn test_recompiled_shader_recreates_every_bound_program() {
    let mut fx = fixture();
    let before: Vec<ForwardMaterial> = fx.entities.iter().map(|e| material(&fx.host, *e)).collect();
    assert_eq!(fx.host.shader_swap().owner_count("fs_forward"), 2);

    write_binary(&fx.root, "fs_forward", b"fs_forward v2");
    fx.host.shader_swap().sender().send(ShaderEvent {
        shader: "fs_forward".to_string(),
    });
    fx.host.tick(Duration::ZERO);

    let log = fx.log.lock().unwrap().clone();
    let first_destroy = log
        .iter()
        .position(|l| l.starts_with("destroy"))
        .expect("old programs destroyed");
    let last_create = log
        .iter()
        .rposition(|l| l.starts_with("create"))
        .expect("programs created");
    assert!(last_create < first_destroy, "destroyed before every creation finished: {:?}", log);

    // Both stage groups of each owner are rebuilt
    assert_eq!(log.iter().filter(|l| l.starts_with("create")).count(), 4);
    assert_eq!(log.iter().filter(|l| l.starts_with("destroy")).count(), 4);

    for (entity, old) in fx.entities.iter().zip(before) {
        let new = material(&fx.host, *entity);
        assert!(new.program.is_valid());
        assert_ne!(new.program, old.program);
        assert_ne!(new.shadow_program, old.shadow_program);
        assert_eq!(new.tint, old.tint);
    }
}

#[test]
fn test_failed_recreation_keeps_old_program() {
    let mut fx = fixture();
    let before: Vec<ForwardMaterial> = fx.entities.iter().map(|e| material(&fx.host, *e)).collect();

    write_binary(&fx.root, "fs_forward", b"");
    fx.host.shader_swap().sender().send(ShaderEvent {
        shader: "fs_forward".to_string(),
    });
    fx.host.tick(Duration::ZERO);

    let log = fx.log.lock().unwrap().clone();
    for (entity, old) in fx.entities.iter().zip(before) {
        let now = material(&fx.host, *entity);
        assert_eq!(now.program, old.program);
        assert!(!log.contains(&format!("destroy {}", old.program.0)));
        // The shadow program does not use the broken stage and is still rebuilt
        assert_ne!(now.shadow_program, old.shadow_program);
    }
}

#[test]
fn test_despawned_owner_is_pruned() {
    let mut fx = fixture();
    let gone = fx.entities[0];
    assert!(fx.host.world_mut().despawn(gone));

    fx.host.shader_swap().sender().send(ShaderEvent {
        shader: "vs_forward".to_string(),
    });
    fx.host.tick(Duration::ZERO);

    assert_eq!(fx.host.shader_swap().owner_count("vs_forward"), 1);
    let log = fx.log.lock().unwrap();
    assert_eq!(log.iter().filter(|l| l.starts_with("create")).count(), 2);
}

#[test]
fn test_started_hot_reload_swaps_rewritten_binary() {
    let workspace = TempDir::new().expect("temp dir");
    let root = workspace.path();
    for dir in ["game", "shader_src", "plugins"] {
        fs::create_dir_all(root.join(dir)).expect("create dir");
    }
    let shader_root = root.join("compiled");
    for name in ["vs_forward", "fs_forward", "vs_shadow", "fs_shadow"] {
        write_binary(&shader_root, name, name.as_bytes());
    }

    let mut config = HostConfig::default();
    config.hot_reload.source_dir = root.join("game");
    config.hot_reload.shader_source_dir = root.join("shader_src");
    config.hot_reload.plugin_dir = root.join("plugins");
    config.graphics.backend = Backend::Vulkan;
    config.graphics.shader_root = Some(shader_root.clone());

    let device = Box::new(RecordingDevice {
        inner: HeadlessDevice::new(Backend::Vulkan),
        log: DeviceLog::default(),
    });
    let mut host = Host::new(config, StaticPackage::new("render", register), device);
    host.init().expect("init");
    let entity = host
        .world_mut()
        .spawn()
        .with(ForwardMaterial {
            program: ProgramHandle::INVALID,
            shadow_program: ProgramHandle::INVALID,
            tint: 7,
        })
        .build()
        .expect("spawn");
    let (swap, world, device) = host.shader_swap_mut();
    swap.load_shaders_for::<ForwardMaterial>(world, device, entity).expect("load shaders");
    let before = material(&host, entity);

    host.start_hot_reload();
    // Source rebuild and shader compile
    assert_eq!(host.pipeline_count(), 2);

    write_binary(&shader_root, "fs_forward", b"fs_forward v2");
    let deadline = Instant::now() + Duration::from_secs(5);
    while material(&host, entity).program == before.program && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
        host.tick(Duration::from_millis(1));
    }

    let after = material(&host, entity);
    assert_ne!(after.program, before.program);
    // Every program of an owner using the stage is rebuilt
    assert_ne!(after.shadow_program, before.shadow_program);
    assert_eq!(after.tint, 7);

    host.shutdown();
    assert_eq!(host.pipeline_count(), 0);
}
