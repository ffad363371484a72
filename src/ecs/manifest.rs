//! Field manifests
//!
//! Every component type carries a `TypeManifest`: its stable name, its size
//! and the byte layout of its fields. Manifests are plain data, so two builds
//! of the same module can be compared without any runtime reflection.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::gfx::ShaderProgramSpec;

/// Scalar field kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PrimitiveKind {
    pub fn size(self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::U8 | PrimitiveKind::I8 => 1,
            PrimitiveKind::U16 | PrimitiveKind::I16 => 2,
            PrimitiveKind::U32 | PrimitiveKind::I32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::U64 | PrimitiveKind::I64 | PrimitiveKind::F64 => 8,
        }
    }
}

/// How a field is stored and how it crosses a rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Assigned directly
    Primitive(PrimitiveKind),
    /// Raw discriminant, assigned directly
    Enum { size: usize },
    /// Host-owned value type that is never rebuilt, assigned directly
    Opaque { type_name: String, size: usize },
    /// Struct declared by a reloadable package, copied field by field
    Nested(TypeManifest),
    /// Fixed-length array
    Array { element: Box<FieldKind>, len: usize },
}

impl FieldKind {
    pub fn size(&self) -> usize {
        match self {
            FieldKind::Primitive(p) => p.size(),
            FieldKind::Enum { size } => *size,
            FieldKind::Opaque { size, .. } => *size,
            FieldKind::Nested(manifest) => manifest.size,
            FieldKind::Array { element, len } => element.size() * len,
        }
    }

    /// Validate every struct layout reachable from this kind
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            FieldKind::Nested(manifest) => manifest.validate(),
            FieldKind::Array { element, .. } => element.validate(),
            _ => Ok(()),
        }
    }

    /// Whether values of this kind may contain reloadable structs
    pub fn is_reloadable(&self) -> bool {
        match self {
            FieldKind::Nested(_) => true,
            FieldKind::Array { element, .. } => element.is_reloadable(),
            _ => false,
        }
    }
}

/// One named field inside a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldManifest {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
    /// Stages this field's program handle is built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shader: Option<ShaderProgramSpec>,
}

impl FieldManifest {
    pub fn new(name: impl Into<String>, offset: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            kind,
            shader: None,
        }
    }

    pub fn with_shader(mut self, shader: ShaderProgramSpec) -> Self {
        self.shader = Some(shader);
        self
    }

    pub fn size(&self) -> usize {
        self.kind.size()
    }
}

/// Structural description of a component type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeManifest {
    /// Stable name, identical across builds of the same type
    pub name: String,
    pub size: usize,
    pub fields: Vec<FieldManifest>,
}

impl TypeManifest {
    pub fn new(name: impl Into<String>, size: usize, fields: Vec<FieldManifest>) -> Self {
        Self {
            name: name.into(),
            size,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldManifest> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_zero_sized(&self) -> bool {
        self.size == 0
    }

    /// Resolve a dotted path (`material.program`) to an absolute offset and
    /// the field it lands on.
    pub fn resolve_path(&self, path: &str) -> Option<(usize, &FieldManifest)> {
        let mut manifest = self;
        let mut base = 0;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            let field = manifest.field(segment)?;
            if segments.peek().is_none() {
                return Some((base + field.offset, field));
            }
            match &field.kind {
                FieldKind::Nested(inner) => {
                    base += field.offset;
                    manifest = inner;
                }
                _ => return None,
            }
        }
        None
    }

    /// Every field annotated with a shader program, as `(path, field)`
    pub fn shader_fields(&self) -> Vec<(String, &FieldManifest)> {
        let mut found = Vec::new();
        self.collect_shader_fields("", &mut found);
        found
    }

    fn collect_shader_fields<'a>(
        &'a self,
        prefix: &str,
        found: &mut Vec<(String, &'a FieldManifest)>,
    ) {
        for field in &self.fields {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{}.{}", prefix, field.name)
            };
            if field.shader.is_some() {
                found.push((path.clone(), field));
            }
            if let FieldKind::Nested(inner) = &field.kind {
                inner.collect_shader_fields(&path, found);
            }
        }
    }

    /// Check that every field fits inside the type and no two fields overlap
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidManifest {
            name: self.name.clone(),
            reason,
        };

        let mut spans: Vec<(usize, usize, &str)> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let end = field.offset + field.size();
            if end > self.size {
                return Err(invalid(format!(
                    "field {} ends at {} past type size {}",
                    field.name, end, self.size
                )));
            }
            if spans.iter().any(|(_, _, name)| *name == field.name) {
                return Err(invalid(format!("duplicate field {}", field.name)));
            }
            let handle_size = std::mem::size_of::<crate::gfx::ProgramHandle>();
            if field.shader.is_some() && field.size() != handle_size {
                return Err(invalid(format!(
                    "shader field {} is not a program handle",
                    field.name
                )));
            }
            field.kind.validate()?;
            spans.push((field.offset, end, &field.name));
        }

        spans.sort_by_key(|(start, _, _)| *start);
        for pair in spans.windows(2) {
            let (_, prev_end, prev) = pair[0];
            let (start, _, next) = pair[1];
            if start < prev_end {
                return Err(invalid(format!("fields {} and {} overlap", prev, next)));
            }
        }
        Ok(())
    }
}

/// Types that can appear as a component field
pub trait FieldType {
    fn kind() -> FieldKind;
}

macro_rules! primitive_field {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl FieldType for $ty {
                fn kind() -> FieldKind {
                    FieldKind::Primitive(PrimitiveKind::$kind)
                }
            }
        )*
    };
}

primitive_field! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

impl<T: FieldType, const N: usize> FieldType for [T; N] {
    fn kind() -> FieldKind {
        FieldKind::Array {
            element: Box::new(T::kind()),
            len: N,
        }
    }
}

/// Plain-data component with a stable name and a manifest
///
/// Implement through the [`component!`](crate::component) macro.
pub trait Component: bytemuck::Pod {
    const NAME: &'static str;

    fn manifest() -> TypeManifest;
}

/// Implement [`Component`] and [`FieldType`] for a `#[repr(C)]` Pod struct.
///
/// ```ignore
/// component!(LightShader {
///     uniform_handle: u16,
///     program: ProgramHandle => ShaderProgramSpec::graphics("vs_light", "fs_light"),
/// });
/// ```
///
/// The stable name defaults to `module_path!()::Type`; pass `as "name"` to
/// pin it explicitly.
#[macro_export]
macro_rules! component {
    (@impl $ty:ident, $name:expr, { $($field:ident : $fty:ty $(=> $shader:expr)?),* $(,)? }) => {
        impl $crate::ecs::Component for $ty {
            const NAME: &'static str = $name;

            fn manifest() -> $crate::ecs::TypeManifest {
                $crate::ecs::TypeManifest::new(
                    <$ty as $crate::ecs::Component>::NAME,
                    ::core::mem::size_of::<$ty>(),
                    vec![$(
                        $crate::ecs::FieldManifest::new(
                            stringify!($field),
                            ::core::mem::offset_of!($ty, $field),
                            <$fty as $crate::ecs::FieldType>::kind(),
                        )$(.with_shader($shader))?,
                    )*],
                )
            }
        }

        impl $crate::ecs::FieldType for $ty {
            fn kind() -> $crate::ecs::FieldKind {
                $crate::ecs::FieldKind::Nested(<$ty as $crate::ecs::Component>::manifest())
            }
        }
    };
    ($ty:ident as $name:literal { $($body:tt)* }) => {
        $crate::component!(@impl $ty, $name, { $($body)* });
    };
    ($ty:ident { $($body:tt)* }) => {
        $crate::component!(
            @impl $ty,
            concat!(module_path!(), "::", stringify!($ty)),
            { $($body)* }
        );
    };
}
