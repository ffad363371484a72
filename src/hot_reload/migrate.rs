//! Component data migration across package builds
//!
//! When a package is reloaded every type it declares comes back with a new
//! token. Types whose stable name is already registered are migrated: the
//! registry slot is replaced, archetype type lists are rewritten and every
//! chunk column is rebuilt under the new layout. Field values are carried
//! over by name through a [`CopyPlan`] computed once per type.

use rustc_hash::FxHashMap;

use super::loader::ModulePackage;
use crate::ecs::{ComponentId, ComponentType, FieldKind, TypeManifest, TypeToken, World};
use crate::error::{EngineError, EngineResult};

/// Copy `len` bytes from offset `src` of an old row to offset `dst` of a
/// new row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

/// Byte-level recipe turning an old row into a new row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPlan {
    old_size: usize,
    new_size: usize,
    ops: Vec<CopyOp>,
    /// Old field paths with no counterpart
    dropped: Vec<String>,
    /// New field paths left at zero
    added: Vec<String>,
}

impl CopyPlan {
    /// Diff two manifests by field name
    ///
    /// Fails when an op would read or write outside either row.
    pub fn build(old: &TypeManifest, new: &TypeManifest) -> EngineResult<Self> {
        let mut plan = Self {
            old_size: old.size,
            new_size: new.size,
            ops: Vec::new(),
            dropped: Vec::new(),
            added: Vec::new(),
        };
        plan.diff(old, new, 0, 0, "");
        if let Some(op) = plan
            .ops
            .iter()
            .find(|op| op.src + op.len > old.size || op.dst + op.len > new.size)
        {
            return Err(EngineError::InvalidManifest {
                name: new.name.clone(),
                reason: format!(
                    "copy of {} bytes from {} to {} leaves a {} -> {} byte row",
                    op.len, op.src, op.dst, old.size, new.size
                ),
            });
        }
        plan.coalesce();
        Ok(plan)
    }

    fn diff(
        &mut self,
        old: &TypeManifest,
        new: &TypeManifest,
        old_base: usize,
        new_base: usize,
        prefix: &str,
    ) {
        let path = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            }
        };

        for field in &new.fields {
            let Some(previous) = old.field(&field.name) else {
                self.added.push(path(&field.name));
                continue;
            };
            let src = old_base + previous.offset;
            let dst = new_base + field.offset;
            if !self.diff_kind(&previous.kind, &field.kind, src, dst, &path(&field.name)) {
                log::debug!(
                    "Field {}::{} changed kind incompatibly, resetting it",
                    new.name,
                    path(&field.name)
                );
                self.dropped.push(path(&field.name));
            }
        }

        for field in &old.fields {
            if new.field(&field.name).is_none() {
                self.dropped.push(path(&field.name));
            }
        }
    }

    /// Emit ops carrying one value; false when the kinds are incompatible
    fn diff_kind(
        &mut self,
        old: &FieldKind,
        new: &FieldKind,
        src: usize,
        dst: usize,
        path: &str,
    ) -> bool {
        match (old, new) {
            (FieldKind::Nested(a), FieldKind::Nested(b)) => {
                if a == b {
                    self.copy(src, dst, a.size);
                } else {
                    self.diff(a, b, src, dst, path);
                }
                true
            }
            (
                FieldKind::Array { element: a, len: la },
                FieldKind::Array { element: b, len: lb },
            ) => {
                let len = (*la).min(*lb);
                if a == b {
                    self.copy(src, dst, a.size() * len);
                    return true;
                }
                if !(a.is_reloadable() && b.is_reloadable()) {
                    return false;
                }
                let (step_a, step_b) = (a.size(), b.size());
                for i in 0..len {
                    let element = format!("{}[{}]", path, i);
                    if !self.diff_kind(a, b, src + i * step_a, dst + i * step_b, &element) {
                        return false;
                    }
                }
                true
            }
            (FieldKind::Primitive(a), FieldKind::Primitive(b)) if a == b => {
                self.copy(src, dst, a.size());
                true
            }
            (FieldKind::Enum { size: a }, FieldKind::Enum { size: b }) if a == b => {
                self.copy(src, dst, *a);
                true
            }
            (
                FieldKind::Opaque { type_name: a, size: sa },
                FieldKind::Opaque { type_name: b, size: sb },
            ) if a == b && sa == sb => {
                self.copy(src, dst, *sa);
                true
            }
            _ => false,
        }
    }

    fn copy(&mut self, src: usize, dst: usize, len: usize) {
        if len > 0 {
            self.ops.push(CopyOp { src, dst, len });
        }
    }

    /// Merge ops that are contiguous on both sides
    fn coalesce(&mut self) {
        self.ops.sort_by_key(|op| op.dst);
        let mut merged: Vec<CopyOp> = Vec::with_capacity(self.ops.len());
        for op in self.ops.drain(..) {
            match merged.last_mut() {
                Some(last) if last.src + last.len == op.src && last.dst + last.len == op.dst => {
                    last.len += op.len;
                }
                _ => merged.push(op),
            }
        }
        self.ops = merged;
    }

    pub fn ops(&self) -> &[CopyOp] {
        &self.ops
    }

    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn new_size(&self) -> usize {
        self.new_size
    }

    /// Whether old rows can be reused byte for byte
    pub fn is_identity(&self) -> bool {
        if self.old_size != self.new_size || !self.dropped.is_empty() || !self.added.is_empty() {
            return false;
        }
        match self.ops.as_slice() {
            [] => self.new_size == 0,
            [op] => op.src == 0 && op.dst == 0 && op.len == self.new_size,
            _ => false,
        }
    }

    /// Fill `new_row` from `old_row`; bytes not covered keep their value
    pub fn apply(&self, old_row: &[u8], new_row: &mut [u8]) {
        for op in &self.ops {
            new_row[op.dst..op.dst + op.len].copy_from_slice(&old_row[op.src..op.src + op.len]);
        }
    }
}

/// What one migration pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Registered types replaced by a new build
    pub migrated_types: Vec<String>,
    /// Package types registered for the first time
    pub registered_types: Vec<String>,
    pub rewritten_columns: usize,
    pub migrated_rows: usize,
    pub dropped_fields: Vec<String>,
    pub added_fields: Vec<String>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.migrated_types.is_empty() && self.registered_types.is_empty()
    }
}

struct TypeMapping {
    new_type: ComponentType,
    plan: CopyPlan,
}

/// Move every live component of a type declared by `package` onto the
/// package's build of that type.
pub fn migrate(world: &mut World, package: &ModulePackage) -> EngineResult<MigrationReport> {
    let mut report = MigrationReport::default();

    // Old token -> new type, planned once per type
    let mut mapping: FxHashMap<TypeToken, TypeMapping> = FxHashMap::default();
    let mut replacements: Vec<(ComponentId, &crate::hot_reload::loader::PackageType)> = Vec::new();
    for descriptor in world.registry().iter() {
        let Some(package_type) = package.type_named(descriptor.name()) else {
            continue;
        };
        if package_type.token == descriptor.token {
            continue;
        }

        let plan = CopyPlan::build(&descriptor.manifest, &package_type.manifest)?;
        let qualify = |field: &String| format!("{}.{}", descriptor.name(), field);
        report.dropped_fields.extend(plan.dropped().iter().map(qualify));
        report.added_fields.extend(plan.added().iter().map(qualify));
        report.migrated_types.push(descriptor.name().to_string());

        let new_type = ComponentType {
            id: descriptor.id,
            token: package_type.token,
            size: package_type.manifest.size,
            zero_sized: package_type.manifest.is_zero_sized(),
        };
        mapping.insert(descriptor.token, TypeMapping { new_type, plan });
        replacements.push((descriptor.id, package_type));
    }

    for (id, package_type) in replacements {
        world
            .registry_mut()
            .replace(id, package_type.manifest.clone(), package_type.token)?;
    }

    if !mapping.is_empty() {
        for archetype in world.archetypes_mut() {
            // Type lists first, then the columns they describe
            for ty in archetype.types_mut() {
                if let Some(m) = mapping.get(&ty.token) {
                    *ty = m.new_type;
                }
            }

            for chunk in archetype.chunks_mut() {
                let capacity = chunk.capacity();
                for column in chunk.columns_mut() {
                    let Some(m) = mapping.get(&column.component_type().token) else {
                        continue;
                    };
                    report.rewritten_columns += 1;
                    report.migrated_rows += column.len();

                    if m.plan.is_identity() {
                        column.retag(m.new_type);
                        continue;
                    }

                    let size = m.new_type.size;
                    let mut data = Vec::with_capacity(size * capacity);
                    for row in 0..column.len() {
                        let start = data.len();
                        data.resize(start + size, 0u8);
                        m.plan.apply(column.row(row), &mut data[start..]);
                    }
                    column.replace_storage(m.new_type, data);
                }
            }
        }
    }

    for package_type in package.types() {
        if world.registry().id_of(&package_type.manifest.name).is_none() {
            world
                .registry_mut()
                .register(package_type.manifest.clone(), package_type.token)?;
            report.registered_types.push(package_type.manifest.name.clone());
        }
    }

    if !report.is_noop() {
        log::info!(
            "Migrated {} types ({} columns, {} rows), registered {} new types",
            report.migrated_types.len(),
            report.rewritten_columns,
            report.migrated_rows,
            report.registered_types.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{FieldManifest, PrimitiveKind};

    fn prim(name: &str, offset: usize, kind: PrimitiveKind) -> FieldManifest {
        FieldManifest::new(name, offset, FieldKind::Primitive(kind))
    }

    fn light_v1() -> TypeManifest {
        TypeManifest::new(
            "game::Light",
            8,
            vec![prim("intensity", 0, PrimitiveKind::F32), prim("range", 4, PrimitiveKind::F32)],
        )
    }

    #[test]
    fn test_identical_manifests_give_identity_plan() {
        let plan = CopyPlan::build(&light_v1(), &light_v1()).expect("plan");
        assert!(plan.is_identity());
        assert_eq!(plan.ops(), &[CopyOp { src: 0, dst: 0, len: 8 }]);
    }

    #[test]
    fn test_reordered_and_added_fields() {
        let new = TypeManifest::new(
            "game::Light",
            12,
            vec![
                prim("color", 0, PrimitiveKind::U32),
                prim("range", 4, PrimitiveKind::F32),
                prim("intensity", 8, PrimitiveKind::F32),
            ],
        );
        let plan = CopyPlan::build(&light_v1(), &new).expect("plan");
        assert!(!plan.is_identity());
        assert_eq!(plan.added(), &["color".to_string()]);
        assert!(plan.dropped().is_empty());

        let mut old_row = Vec::new();
        old_row.extend_from_slice(&1.5f32.to_ne_bytes());
        old_row.extend_from_slice(&20.0f32.to_ne_bytes());
        let mut new_row = vec![0u8; 12];
        plan.apply(&old_row, &mut new_row);

        assert_eq!(&new_row[0..4], &[0; 4]);
        assert_eq!(&new_row[4..8], &20.0f32.to_ne_bytes());
        assert_eq!(&new_row[8..12], &1.5f32.to_ne_bytes());
    }

    #[test]
    fn test_removed_and_retyped_fields_are_dropped() {
        let new = TypeManifest::new(
            "game::Light",
            8,
            vec![prim("intensity", 0, PrimitiveKind::F64)],
        );
        let plan = CopyPlan::build(&light_v1(), &new).expect("plan");
        assert!(plan.ops().is_empty());
        assert_eq!(plan.dropped(), &["intensity".to_string(), "range".to_string()]);
    }

    #[test]
    fn test_nested_structs_recurse_by_name() {
        let inner_old = TypeManifest::new(
            "game::Falloff",
            8,
            vec![prim("linear", 0, PrimitiveKind::F32), prim("quadratic", 4, PrimitiveKind::F32)],
        );
        let inner_new = TypeManifest::new(
            "game::Falloff",
            8,
            vec![prim("quadratic", 0, PrimitiveKind::F32), prim("linear", 4, PrimitiveKind::F32)],
        );
        let old = TypeManifest::new(
            "game::Spot",
            12,
            vec![
                prim("id", 0, PrimitiveKind::U32),
                FieldManifest::new("falloff", 4, FieldKind::Nested(inner_old)),
            ],
        );
        let new = TypeManifest::new(
            "game::Spot",
            12,
            vec![
                FieldManifest::new("falloff", 0, FieldKind::Nested(inner_new)),
                prim("id", 8, PrimitiveKind::U32),
            ],
        );

        let plan = CopyPlan::build(&old, &new).expect("plan");
        assert_eq!(
            plan.ops(),
            &[
                CopyOp { src: 8, dst: 0, len: 4 },
                CopyOp { src: 4, dst: 4, len: 4 },
                CopyOp { src: 0, dst: 8, len: 4 },
            ]
        );
    }

    #[test]
    fn test_adjacent_copies_coalesce() {
        let new = TypeManifest::new(
            "game::Light",
            12,
            vec![
                prim("intensity", 0, PrimitiveKind::F32),
                prim("range", 4, PrimitiveKind::F32),
                prim("flicker", 8, PrimitiveKind::F32),
            ],
        );
        let plan = CopyPlan::build(&light_v1(), &new).expect("plan");
        assert_eq!(plan.ops(), &[CopyOp { src: 0, dst: 0, len: 8 }]);
        assert_eq!(plan.new_size(), 12);
    }

    #[test]
    fn test_arrays_copy_common_prefix() {
        let array = |len| FieldKind::Array {
            element: Box::new(FieldKind::Primitive(PrimitiveKind::U16)),
            len,
        };
        let old =
            TypeManifest::new("game::Path", 8, vec![FieldManifest::new("nodes", 0, array(4))]);
        let new =
            TypeManifest::new("game::Path", 4, vec![FieldManifest::new("nodes", 0, array(2))]);
        let plan = CopyPlan::build(&old, &new).expect("plan");
        assert_eq!(plan.ops(), &[CopyOp { src: 0, dst: 0, len: 4 }]);
    }

    #[test]
    fn test_out_of_bounds_plan_is_rejected() {
        let cell = |offset| {
            FieldKind::Array {
                element: Box::new(FieldKind::Nested(TypeManifest::new(
                    "game::Cell",
                    4,
                    vec![prim("a", offset, PrimitiveKind::U32)],
                ))),
                len: 2,
            }
        };
        let old =
            TypeManifest::new("game::Grid", 8, vec![FieldManifest::new("cells", 0, cell(0))]);
        let new =
            TypeManifest::new("game::Grid", 8, vec![FieldManifest::new("cells", 0, cell(100))]);
        assert!(CopyPlan::build(&old, &new).is_err());
    }
}
