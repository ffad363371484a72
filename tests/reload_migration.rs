//! Reloading a package into a running host migrates live component data

use std::time::Duration;

use hotswap_engine::component;
use hotswap_engine::{
    HeadlessDevice, Host, HostConfig, PackageRegistrar, PackageSource, ReloadOutcome, StaticPackage,
    World,
};
use hotswap_engine::gfx::Backend;

mod v1 {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct LightShader {
        pub uniform_handle: u16,
        pub flags: u16,
        pub intensity: f32,
    }

    component!(LightShader as "lights::LightShader" {
        uniform_handle: u16,
        flags: u16,
        intensity: f32,
    });

    pub fn register(registrar: &mut PackageRegistrar) {
        registrar.component::<LightShader>();
    }
}

mod v2 {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct LightShader {
        pub intensity: f32,
        pub range: f32,
        pub uniform_handle: u16,
        pub flags: u16,
    }

    component!(LightShader as "lights::LightShader" {
        intensity: f32,
        range: f32,
        uniform_handle: u16,
        flags: u16,
    });

    pub fn register(registrar: &mut PackageRegistrar) {
        registrar.component::<LightShader>();
    }
}

mod grid {
    use super::*;
    use hotswap_engine::{Component, FieldKind};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct Cell {
        pub a: u32,
    }

    component!(Cell as "game::Cell" { a: u32 });

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    pub struct Grid {
        pub cells: [Cell; 2],
    }

    component!(Grid as "game::Grid" { cells: [Cell; 2] });

    pub fn register(registrar: &mut PackageRegistrar) {
        registrar.component::<Grid>();
    }

    /// Same type name, but the cell field sits outside the cell
    pub fn register_misplaced_cell(registrar: &mut PackageRegistrar) {
        let mut manifest = Grid::manifest();
        if let FieldKind::Array { element, .. } = &mut manifest.fields[0].kind {
            if let FieldKind::Nested(cell) = element.as_mut() {
                cell.fields[0].offset = 100;
            }
        }
        registrar.manifest(manifest);
    }
}

fn headless_host(register: fn(&mut PackageRegistrar)) -> Host<StaticPackage> {
    let mut config = HostConfig::default();
    config.hot_reload.enabled = false;
    let device = Box::new(HeadlessDevice::new(Backend::Vulkan));
    let mut host = Host::new(config, StaticPackage::new("lights", register), device);
    host.init().expect("init");
    let sender = host.reload_sender();
    host.source_mut().watch(sender).expect("watch");
    host
}

fn spawn_lights(world: &mut World, count: u16) {
    for i in 0..count {
        world
            .spawn()
            .with(v1::LightShader {
                uniform_handle: i,
                flags: 1,
                intensity: f32::from(i) * 0.5,
            })
            .build()
            .expect("spawn");
    }
}

#[test]
fn test_light_keeps_uniform_handle_under_new_token() {
    let mut host = headless_host(v1::register);
    let entity = host
        .world_mut()
        .spawn()
        .with(v1::LightShader {
            uniform_handle: 7,
            flags: 3,
            intensity: 2.5,
        })
        .build()
        .expect("spawn");
    let id = host.world().registry().id_of("lights::LightShader").expect("registered");
    let old_token = host.world().registry().get(id).map(|d| d.token).expect("descriptor");

    host.source_mut().set_register(v2::register);
    host.source_mut().rebuild();
    host.tick(Duration::ZERO);

    let descriptor = host.world().registry().get(id).expect("descriptor");
    assert_ne!(descriptor.token, old_token);
    assert_eq!(descriptor.size, 12);
    assert_eq!(host.world().registry().id_of("lights::LightShader"), Some(id));

    let light = host.world().get::<v2::LightShader>(entity).expect("migrated light");
    assert_eq!(
        light,
        v2::LightShader {
            intensity: 2.5,
            range: 0.0,
            uniform_handle: 7,
            flags: 3,
        }
    );
}

#[test]
fn test_migration_keeps_chunks_consistent() {
    let mut host = headless_host(v1::register);
    spawn_lights(host.world_mut(), 300);
    let before: Vec<usize> = host.world().archetypes().iter().map(|a| a.len()).collect();
    let chunks_before: usize = host.world().archetypes().iter().map(|a| a.chunks().len()).sum();

    host.source_mut().set_register(v2::register);
    host.source_mut().rebuild();
    host.tick(Duration::ZERO);

    let after: Vec<usize> = host.world().archetypes().iter().map(|a| a.len()).collect();
    let chunks_after: usize = host.world().archetypes().iter().map(|a| a.chunks().len()).sum();
    assert_eq!(before, after);
    assert_eq!(chunks_before, chunks_after);
    assert_eq!(host.world().entity_count(), 300);

    for archetype in host.world().archetypes() {
        for chunk in archetype.chunks() {
            assert!(chunk.is_consistent());
            for column in chunk.columns() {
                assert_eq!(column.len(), chunk.len());
            }
        }
    }

    let mut lights = host.world().query::<v2::LightShader>();
    lights.sort_by_key(|(_, light)| light.uniform_handle);
    for (i, (_, light)) in lights.iter().enumerate() {
        assert_eq!(usize::from(light.uniform_handle), i);
        assert_eq!(light.flags, 1);
        assert_eq!(light.intensity, i as f32 * 0.5);
    }
}

#[test]
fn test_trivial_rebuild_is_idempotent() {
    let mut host = headless_host(v1::register);
    spawn_lights(host.world_mut(), 4);
    let snapshot = host.world().query::<v1::LightShader>();

    host.source_mut().rebuild();
    match host.reload().expect("reload") {
        ReloadOutcome::Applied { report, .. } => {
            assert_eq!(report.migrated_types, vec!["lights::LightShader".to_string()]);
            assert!(report.dropped_fields.is_empty());
            assert!(report.added_fields.is_empty());
        }
        ReloadOutcome::Unchanged => panic!("a rebuild must mint new tokens"),
    }
    assert_eq!(host.world().query::<v1::LightShader>(), snapshot);

    assert_eq!(host.reload().expect("reload"), ReloadOutcome::Unchanged);
    assert_eq!(host.world().query::<v1::LightShader>(), snapshot);
}

#[test]
fn test_two_queued_reloads_second_is_noop() {
    let mut host = headless_host(v1::register);
    spawn_lights(host.world_mut(), 8);

    host.source_mut().set_register(v2::register);
    host.source_mut().rebuild();
    host.source_mut().rebuild();
    assert_eq!(host.pending_reloads(), 2);

    assert_eq!(host.drain_reloads(), 2);
    assert_eq!(host.pending_reloads(), 0);
    assert_eq!(host.reloads_applied(), 1);
    assert_eq!(host.world().query::<v2::LightShader>().len(), 8);
}

#[test]
fn test_failed_reload_keeps_running_build() {
    fn broken(registrar: &mut PackageRegistrar) {
        registrar.component::<v1::LightShader>().component::<v1::LightShader>();
    }

    let mut host = headless_host(v1::register);
    spawn_lights(host.world_mut(), 2);
    let id = host.world().registry().id_of("lights::LightShader").expect("registered");
    let token = host.world().registry().get(id).map(|d| d.token);

    host.source_mut().set_register(broken);
    host.source_mut().rebuild();
    host.tick(Duration::ZERO);

    assert_eq!(host.world().registry().get(id).map(|d| d.token), token);
    assert_eq!(host.reloads_applied(), 0);
    assert_eq!(host.world().query::<v1::LightShader>().len(), 2);
}

#[test]
fn test_misplaced_array_element_field_is_rejected() {
    let mut host = headless_host(grid::register);
    let entity = host
        .world_mut()
        .spawn()
        .with(grid::Grid {
            cells: [grid::Cell { a: 1 }, grid::Cell { a: 2 }],
        })
        .build()
        .expect("spawn");
    let id = host.world().registry().id_of("game::Grid").expect("registered");
    let token = host.world().registry().get(id).map(|d| d.token);

    host.source_mut().set_register(grid::register_misplaced_cell);
    host.source_mut().rebuild();
    host.tick(Duration::ZERO);

    assert_eq!(host.reloads_applied(), 0);
    assert_eq!(host.world().registry().get(id).map(|d| d.token), token);
    assert_eq!(
        host.world().get::<grid::Grid>(entity).map(|g| g.cells),
        Some([grid::Cell { a: 1 }, grid::Cell { a: 2 }])
    );
}
