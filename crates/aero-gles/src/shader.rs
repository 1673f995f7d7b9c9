//! Shader-compiler collaborator interface and linked-program reflection.
//!
//! GLSL ES rewriting and cross-compilation happen behind [`ShaderCompiler`]; this crate only
//! consumes the compiled native module plus the binding layout the compiler reports.

use std::collections::BTreeMap;

use crate::error::ProgramError;
use crate::state::MAX_VERTEX_ATTRIBS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Output of the shader compiler: native shader source plus its entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub code: String,
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedAttribute {
    pub name: String,
    pub location: u32,
}

/// A uniform living in the default (non-block) uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedUniform {
    pub name: String,
    /// GL uniform location handed out by `glGetUniformLocation`.
    pub location: u32,
    /// Byte offset inside the default block.
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedUniformBlock {
    pub name: String,
    /// Native binding slot the compiled shader reads the block from.
    pub binding: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedSampler {
    pub name: String,
    pub binding: u32,
}

/// Native location of the default uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultBlockLayout {
    pub binding: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub attributes: Vec<ReflectedAttribute>,
    pub uniforms: Vec<ReflectedUniform>,
    pub uniform_blocks: Vec<ReflectedUniformBlock>,
    pub samplers: Vec<ReflectedSampler>,
    pub default_block: Option<DefaultBlockLayout>,
}

pub trait ShaderCompiler: Send {
    fn compile(&mut self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String>;
    fn reflect(&self, shader: &CompiledShader) -> Result<ShaderReflection, String>;
}

/// Merged reflection of a linked vertex + fragment pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramReflection {
    pub attributes: Vec<ReflectedAttribute>,
    pub uniforms: Vec<ReflectedUniform>,
    pub uniform_blocks: Vec<ReflectedUniformBlock>,
    pub samplers: Vec<ReflectedSampler>,
    pub default_block: Option<DefaultBlockLayout>,
    /// Bit `n` is set when the vertex stage reads attribute location `n`.
    pub attribute_mask: u32,
}

impl ProgramReflection {
    pub fn consumes_attribute(&self, location: usize) -> bool {
        location < 32 && self.attribute_mask & (1 << location) != 0
    }

    pub fn uniform(&self, location: u32) -> Option<&ReflectedUniform> {
        self.uniforms.iter().find(|u| u.location == location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedProgram {
    pub vertex: CompiledShader,
    pub fragment: CompiledShader,
    pub reflection: ProgramReflection,
}

impl LinkedProgram {
    pub fn link(
        compiler: &mut dyn ShaderCompiler,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<Self, ProgramError> {
        let vertex = compile_stage(compiler, vertex_source, ShaderStage::Vertex)?;
        let fragment = compile_stage(compiler, fragment_source, ShaderStage::Fragment)?;
        let vs = compiler.reflect(&vertex).map_err(ProgramError::Link)?;
        let fs = compiler.reflect(&fragment).map_err(ProgramError::Link)?;
        let reflection = merge_reflection(vs, fs)?;
        Ok(Self {
            vertex,
            fragment,
            reflection,
        })
    }
}

fn compile_stage(
    compiler: &mut dyn ShaderCompiler,
    source: &str,
    stage: ShaderStage,
) -> Result<CompiledShader, ProgramError> {
    compiler
        .compile(source, stage)
        .map_err(|message| ProgramError::Compile { stage, message })
}

fn merge_reflection(
    vs: ShaderReflection,
    fs: ShaderReflection,
) -> Result<ProgramReflection, ProgramError> {
    let mut attribute_mask = 0u32;
    for attr in &vs.attributes {
        let loc = attr.location as usize;
        if loc >= MAX_VERTEX_ATTRIBS {
            return Err(ProgramError::Link(format!(
                "attribute `{}` uses location {loc} (max {})",
                attr.name,
                MAX_VERTEX_ATTRIBS - 1
            )));
        }
        if attribute_mask & (1 << loc) != 0 {
            return Err(ProgramError::Link(format!(
                "attribute location {loc} assigned twice"
            )));
        }
        attribute_mask |= 1 << loc;
    }

    let mut uniforms: BTreeMap<String, ReflectedUniform> = BTreeMap::new();
    for u in vs.uniforms.into_iter().chain(fs.uniforms) {
        match uniforms.get(&u.name) {
            Some(existing) if existing != &u => {
                return Err(ProgramError::Link(format!(
                    "uniform `{}` declared differently in each stage",
                    u.name
                )));
            }
            Some(_) => {}
            None => {
                uniforms.insert(u.name.clone(), u);
            }
        }
    }

    let mut blocks: BTreeMap<String, ReflectedUniformBlock> = BTreeMap::new();
    for b in vs.uniform_blocks.into_iter().chain(fs.uniform_blocks) {
        match blocks.get(&b.name) {
            Some(existing) if existing != &b => {
                return Err(ProgramError::Link(format!(
                    "uniform block `{}` declared differently in each stage",
                    b.name
                )));
            }
            Some(_) => {}
            None => {
                blocks.insert(b.name.clone(), b);
            }
        }
    }

    let mut samplers: BTreeMap<String, ReflectedSampler> = BTreeMap::new();
    for s in vs.samplers.into_iter().chain(fs.samplers) {
        samplers.entry(s.name.clone()).or_insert(s);
    }

    let default_block = match (vs.default_block, fs.default_block) {
        (Some(a), Some(b)) if a.binding != b.binding => {
            return Err(ProgramError::Link(
                "default uniform block bound to different slots per stage".into(),
            ));
        }
        (Some(a), Some(b)) => Some(DefaultBlockLayout {
            binding: a.binding,
            size: a.size.max(b.size),
        }),
        (a, b) => a.or(b),
    };

    let mut uniform_blocks: Vec<_> = blocks.into_values().collect();
    uniform_blocks.sort_by_key(|b| b.binding);

    Ok(ProgramReflection {
        attributes: vs.attributes,
        uniforms: uniforms.into_values().collect(),
        uniform_blocks,
        samplers: samplers.into_values().collect(),
        default_block,
        attribute_mask,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Compiler for unit tests. Sources are line-oriented declarations:
    /// `in <location> <name>`, `uniform <location> <name> <offset> <size>`,
    /// `block <name> <binding> <size>`, `default <binding> <size>` and `fail <message>`.
    #[derive(Debug, Default)]
    pub(crate) struct DeclCompiler;

    impl ShaderCompiler for DeclCompiler {
        fn compile(&mut self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String> {
            if let Some(msg) = source.lines().find_map(|l| l.trim().strip_prefix("fail ")) {
                return Err(msg.to_string());
            }
            Ok(CompiledShader {
                stage,
                code: source.to_string(),
                entry_point: "main".into(),
            })
        }

        fn reflect(&self, shader: &CompiledShader) -> Result<ShaderReflection, String> {
            let mut out = ShaderReflection::default();
            for line in shader.code.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let num = |i: usize| -> Result<u32, String> {
                    parts
                        .get(i)
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| format!("bad declaration `{line}`"))
                };
                match parts.first().copied() {
                    Some("in") if shader.stage == ShaderStage::Vertex => {
                        out.attributes.push(ReflectedAttribute {
                            name: parts.get(2).unwrap_or(&"").to_string(),
                            location: num(1)?,
                        })
                    }
                    Some("uniform") => out.uniforms.push(ReflectedUniform {
                        name: parts.get(2).unwrap_or(&"").to_string(),
                        location: num(1)?,
                        offset: num(3)?,
                        size: num(4)?,
                    }),
                    Some("block") => out.uniform_blocks.push(ReflectedUniformBlock {
                        name: parts.get(1).unwrap_or(&"").to_string(),
                        binding: num(2)?,
                        size: num(3)?,
                    }),
                    Some("default") => {
                        out.default_block = Some(DefaultBlockLayout {
                            binding: num(1)?,
                            size: num(2)?,
                        })
                    }
                    _ => {}
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::DeclCompiler;
    use super::*;

    #[test]
    fn link_merges_stage_reflection() {
        let mut compiler = DeclCompiler;
        let program = LinkedProgram::link(
            &mut compiler,
            "in 0 position\nin 3 color\nuniform 0 mvp 0 64\ndefault 0 80",
            "uniform 0 mvp 0 64\nuniform 1 tint 64 16\nblock Lights 1 256\ndefault 0 80",
        )
        .unwrap();

        assert_eq!(program.reflection.attribute_mask, 0b1001);
        assert!(program.reflection.consumes_attribute(3));
        assert!(!program.reflection.consumes_attribute(1));
        assert_eq!(program.reflection.uniforms.len(), 2);
        assert_eq!(program.reflection.uniform(1).map(|u| u.offset), Some(64));
        assert_eq!(program.reflection.uniform_blocks[0].binding, 1);
        assert_eq!(
            program.reflection.default_block,
            Some(DefaultBlockLayout {
                binding: 0,
                size: 80
            })
        );
    }

    #[test]
    fn link_reports_compile_and_link_failures() {
        let mut compiler = DeclCompiler;
        let err = LinkedProgram::link(&mut compiler, "fail syntax error", "").unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Compile {
                stage: ShaderStage::Vertex,
                ..
            }
        ));

        let err = LinkedProgram::link(
            &mut compiler,
            "uniform 0 mvp 0 64",
            "uniform 0 mvp 16 64",
        )
        .unwrap_err();
        assert!(matches!(err, ProgramError::Link(_)));

        let err = LinkedProgram::link(&mut compiler, "in 1 a\nin 1 b", "").unwrap_err();
        assert!(matches!(err, ProgramError::Link(_)));
    }
}
