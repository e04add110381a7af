use std::collections::{BTreeMap, BTreeSet};

use wgpu::naga::front::glsl;
use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};
use wgpu::naga::{AddressSpace, Binding, Module, ShaderStage, TypeInner};

use crate::error::{FilterError, FilterResult, ShaderKind};
use crate::gpu::{GpuBackend, ProgramId, ProgramSource};
use crate::matrix::Mat4;

/// Location of one member inside the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformField {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub name: Option<String>,
}

/// A linked program together with the reflection data needed to feed it.
///
/// Both stages are parsed and validated on the CPU before the backend sees
/// them, so a broken filter never reaches the GPU.
#[derive(Debug)]
pub struct ShaderProgram {
    id: ProgramId,
    label: String,
    attributes: Vec<VertexAttribute>,
    uniforms: BTreeMap<String, UniformField>,
    uniform_size: u32,
}

impl ShaderProgram {
    pub fn compile(
        gpu: &mut dyn GpuBackend,
        label: &str,
        vertex: &str,
        fragment: &str,
    ) -> FilterResult<Self> {
        let reflection = reflect(label, vertex, fragment)?;
        let id = gpu.create_program(&ProgramSource {
            label,
            vertex,
            fragment,
            uniform_size: u64::from(reflection.uniform_size),
        })?;
        tracing::debug!(
            label,
            program = id.raw(),
            uniform_size = reflection.uniform_size,
            attributes = reflection.attributes.len(),
            "compiled shader program"
        );
        Ok(Self {
            id,
            label: label.to_string(),
            attributes: reflection.attributes,
            uniforms: reflection.uniforms,
            uniform_size: reflection.uniform_size,
        })
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn uniform(&self, name: &str) -> Option<UniformField> {
        self.uniforms.get(name).copied()
    }

    pub fn uniforms(&self) -> impl Iterator<Item = (&str, UniformField)> {
        self.uniforms.iter().map(|(name, field)| (name.as_str(), *field))
    }

    pub fn uniform_size(&self) -> u32 {
        self.uniform_size
    }

    /// Zeroed CPU copy of the uniform block, laid out for this program.
    pub fn uniform_block(&self) -> UniformBlock {
        UniformBlock {
            fields: self.uniforms.clone(),
            bytes: vec![0; self.uniform_size as usize],
        }
    }

    pub fn destroy(self, gpu: &mut dyn GpuBackend) {
        gpu.delete_program(self.id);
    }
}

/// Reflection result for a vertex/fragment pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramReflection {
    pub attributes: Vec<VertexAttribute>,
    pub uniforms: BTreeMap<String, UniformField>,
    pub uniform_size: u32,
}

/// Parses, validates and links a vertex/fragment pair without touching the GPU.
pub fn reflect(label: &str, vertex: &str, fragment: &str) -> FilterResult<ProgramReflection> {
    let vertex_module = parse_and_validate(label, ShaderKind::Vertex, vertex)?;
    let fragment_module = parse_and_validate(label, ShaderKind::Fragment, fragment)?;

    let outputs = vertex_output_locations(&vertex_module);
    for location in fragment_input_locations(&fragment_module) {
        if !outputs.contains(&location) {
            return Err(FilterError::Compile {
                label: label.to_string(),
                stage: ShaderKind::Fragment,
                message: format!(
                    "link failed: fragment input at location {location} has no matching vertex output"
                ),
            });
        }
    }

    let vertex_block = uniform_block_layout(&vertex_module);
    let fragment_block = uniform_block_layout(&fragment_module);
    let (uniforms, uniform_size) = match (vertex_block, fragment_block) {
        (Some(vertex), Some(fragment)) if vertex.1 != fragment.1 => {
            return Err(FilterError::Compile {
                label: label.to_string(),
                stage: ShaderKind::Fragment,
                message: format!(
                    "link failed: uniform block is {} bytes in the vertex stage but {} in the fragment stage",
                    vertex.1, fragment.1
                ),
            });
        }
        (Some((mut fields, size)), Some((fragment_fields, _))) => {
            fields.extend(fragment_fields);
            (fields, size)
        }
        (Some(block), None) | (None, Some(block)) => block,
        (None, None) => (BTreeMap::new(), 0),
    };

    Ok(ProgramReflection {
        attributes: vertex_attributes(&vertex_module),
        uniforms,
        uniform_size,
    })
}

fn parse_and_validate(label: &str, kind: ShaderKind, source: &str) -> FilterResult<Module> {
    let stage = match kind {
        ShaderKind::Vertex => ShaderStage::Vertex,
        ShaderKind::Fragment => ShaderStage::Fragment,
    };
    let compile_error = |message: String| FilterError::Compile {
        label: label.to_string(),
        stage: kind,
        message: message.trim_end().to_string(),
    };

    let mut frontend = glsl::Frontend::default();
    let module = frontend
        .parse(&glsl::Options::from(stage), source)
        .map_err(|err| compile_error(err.to_string()))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| compile_error(err.to_string()))?;
    Ok(module)
}

fn uniform_block_layout(module: &Module) -> Option<(BTreeMap<String, UniformField>, u32)> {
    module.global_variables.iter().find_map(|(_, variable)| {
        if variable.space != AddressSpace::Uniform {
            return None;
        }
        let TypeInner::Struct { members, span } = &module.types[variable.ty].inner else {
            return None;
        };
        let fields = members
            .iter()
            .filter_map(|member| {
                let name = member.name.clone()?;
                let size = module.types[member.ty].inner.size(module.to_ctx());
                Some((
                    name,
                    UniformField {
                        offset: member.offset,
                        size,
                    },
                ))
            })
            .collect();
        Some((fields, *span))
    })
}

fn vertex_attributes(module: &Module) -> Vec<VertexAttribute> {
    module
        .entry_points
        .iter()
        .filter(|entry| entry.stage == ShaderStage::Vertex)
        .flat_map(|entry| entry.function.arguments.iter())
        .filter_map(|argument| match argument.binding {
            Some(Binding::Location { location, .. }) => Some(VertexAttribute {
                location,
                name: argument.name.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn fragment_input_locations(module: &Module) -> BTreeSet<u32> {
    module
        .entry_points
        .iter()
        .filter(|entry| entry.stage == ShaderStage::Fragment)
        .flat_map(|entry| entry.function.arguments.iter())
        .filter_map(|argument| match argument.binding {
            Some(Binding::Location { location, .. }) => Some(location),
            _ => None,
        })
        .collect()
}

fn vertex_output_locations(module: &Module) -> BTreeSet<u32> {
    let mut locations = BTreeSet::new();
    for entry in module
        .entry_points
        .iter()
        .filter(|entry| entry.stage == ShaderStage::Vertex)
    {
        let Some(result) = entry.function.result.as_ref() else {
            continue;
        };
        if let Some(Binding::Location { location, .. }) = result.binding {
            locations.insert(location);
        }
        if let TypeInner::Struct { members, .. } = &module.types[result.ty].inner {
            for member in members {
                if let Some(Binding::Location { location, .. }) = member.binding {
                    locations.insert(location);
                }
            }
        }
    }
    locations
}

/// Value written into a named uniform member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4(Mat4),
}

impl UniformValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            UniformValue::Float(value) => bytemuck::bytes_of(value),
            UniformValue::Int(value) => bytemuck::bytes_of(value),
            UniformValue::Vec2(value) => bytemuck::cast_slice(value),
            UniformValue::Vec3(value) => bytemuck::cast_slice(value),
            UniformValue::Vec4(value) => bytemuck::cast_slice(value),
            UniformValue::Mat4(value) => bytemuck::cast_slice(value),
        }
    }
}

/// CPU-side staging copy of a program's uniform block.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBlock {
    fields: BTreeMap<String, UniformField>,
    bytes: Vec<u8>,
}

impl UniformBlock {
    /// Writes `value` into the member called `name`. Unknown names and values
    /// that do not fit the member are ignored and reported as `false`.
    pub fn set(&mut self, name: &str, value: UniformValue) -> bool {
        let Some(field) = self.fields.get(name) else {
            tracing::trace!(name, "ignoring update for unknown uniform");
            return false;
        };
        let data = value.as_bytes();
        let start = field.offset as usize;
        let end = start + data.len();
        if data.len() > field.size as usize || end > self.bytes.len() {
            tracing::warn!(
                name,
                expected = field.size,
                actual = data.len(),
                "uniform value does not fit its member"
            );
            return false;
        }
        self.bytes[start..end].copy_from_slice(data);
        true
    }

    pub fn get_f32(&self, name: &str) -> Option<f32> {
        let field = self.fields.get(name)?;
        let start = field.offset as usize;
        let raw = self.bytes.get(start..start + 4)?;
        Some(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::RecordingBackend;
    use crate::shaders::{wrap_fragment, IDENTITY_BODY, VERTEX_SHADER};

    #[test]
    fn reflection_reports_std140_layout() {
        let reflection = reflect("identity", VERTEX_SHADER, &wrap_fragment(IDENTITY_BODY)).unwrap();
        assert_eq!(reflection.uniform_size, 96);
        let offsets: Vec<(&str, u32, u32)> = reflection
            .uniforms
            .iter()
            .map(|(name, field)| (name.as_str(), field.offset, field.size))
            .collect();
        assert!(offsets.contains(&("textureTransform", 0, 64)));
        assert!(offsets.contains(&("tint", 64, 16)));
        assert!(offsets.contains(&("texelSize", 80, 8)));
        assert!(offsets.contains(&("intensity", 88, 4)));
        assert!(offsets.contains(&("time", 92, 4)));

        let mut locations: Vec<u32> = reflection.attributes.iter().map(|a| a.location).collect();
        locations.sort_unstable();
        assert_eq!(locations, vec![0, 1]);
    }

    #[test]
    fn syntax_error_is_reported_per_stage() {
        let broken = wrap_fragment("void mainImage(out vec4 color, in vec2 uv) { color = ; }");
        let err = reflect("broken", VERTEX_SHADER, &broken).unwrap_err();
        match err {
            FilterError::Compile { label, stage, .. } => {
                assert_eq!(label, "broken");
                assert_eq!(stage, ShaderKind::Fragment);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn failed_compile_creates_no_program() {
        let mut gpu = RecordingBackend::new();
        let result = ShaderProgram::compile(&mut gpu, "broken", VERTEX_SHADER, "#version 450\nvoid main( {");
        assert!(result.is_err());
        assert_eq!(gpu.live_objects().programs, 0);
    }

    #[test]
    fn uniform_block_writes_at_member_offsets() {
        let mut gpu = RecordingBackend::new();
        let program =
            ShaderProgram::compile(&mut gpu, "identity", VERTEX_SHADER, &wrap_fragment(IDENTITY_BODY))
                .unwrap();
        let mut block = program.uniform_block();
        assert_eq!(block.as_bytes().len(), 96);
        assert!(block.set("intensity", UniformValue::Float(0.5)));
        assert_eq!(&block.as_bytes()[88..92], &0.5f32.to_ne_bytes());
        assert_eq!(block.get_f32("intensity"), Some(0.5));
        assert!(!block.set("missing", UniformValue::Float(1.0)));
        assert!(!block.set("intensity", UniformValue::Vec4([1.0; 4])));
        program.destroy(&mut gpu);
        assert_eq!(gpu.live_objects().programs, 0);
    }
}
