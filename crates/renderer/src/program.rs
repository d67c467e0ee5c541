//! Program Builder: dialect normalisation, compile, link.
//!
//! Shader authors write ordinary desktop GLSL (`#version 330 core` or no
//! directive at all). Every source is rewritten to the embedded dialect the
//! host always runs against before it reaches the driver, so no other module
//! needs per-platform branching.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::gl::{Gpu, ProgramId, ShaderId, ShaderStage, UniformLocation};

/// Version directive every source is normalised to.
pub const TARGET_VERSION: &str = "#version 300 es";

/// Full-screen triangle generated from `gl_VertexID`; needs no vertex buffers.
pub const BUILTIN_VERTEX: &str = r#"#version 330 core
out vec2 v_uv;

void main() {
    vec2 corner = vec2(float((gl_VertexID << 1) & 2), float(gl_VertexID & 2));
    v_uv = corner;
    gl_Position = vec4(corner * 2.0 - 1.0, 0.0, 1.0);
}
"#;

/// Copies `u_texture` unchanged. `u_flip_y` mirrors vertically when set to 1.
pub const PASSTHROUGH_FRAGMENT: &str = r#"#version 330 core
in vec2 v_uv;
out vec4 frag_color;

uniform sampler2D u_texture;
uniform float u_flip_y;

void main() {
    vec2 uv = vec2(v_uv.x, mix(v_uv.y, 1.0 - v_uv.y, u_flip_y));
    frag_color = texture(u_texture, uv);
}
"#;

/// Main program used until a user shader builds successfully.
pub const FALLBACK_FRAGMENT: &str = r#"#version 330 core
// fallback gradient
out vec4 frag_color;

uniform float u_time;
uniform vec2 u_resolution;

void main() {
    vec2 uv = gl_FragCoord.xy / max(u_resolution, vec2(1.0));
    vec3 color = 0.5 + 0.5 * cos(u_time + uv.xyx + vec3(0.0, 2.0, 4.0));
    frag_color = vec4(color, 1.0);
}
"#;

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("failed to create {object}: {reason}")]
    CreateObject { object: &'static str, reason: String },
    #[error("{stage} shader failed to compile:\n{log}")]
    Compile {
        stage: ShaderStage,
        log: String,
        /// Source exactly as handed to the driver, after normalisation.
        transformed_source: String,
    },
    #[error("program failed to link:\n{log}")]
    Link { log: String },
}

impl ProgramError {
    /// Normalised source attached to compile failures.
    pub fn transformed_source(&self) -> Option<&str> {
        match self {
            ProgramError::Compile {
                transformed_source, ..
            } => Some(transformed_source),
            _ => None,
        }
    }
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("//")
}

fn declares_float_precision(source: &str) -> bool {
    source.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some("precision")
            && tokens.nth(1).map(|ty| ty.trim_end_matches(';')) == Some("float")
    })
}

/// Rewrites `source` into the embedded dialect.
///
/// A missing `#version` is injected; desktop directives (with or without a
/// `core`/`compatibility` profile) are replaced; an existing `es` directive is
/// kept. Fragment sources gain `precision highp float;` unless they already
/// declare a float precision; the statement is placed after any leading
/// `#extension`/`#define` lines. Blank and comment lines that preceded the
/// directive follow the new header unchanged.
pub fn normalize_dialect(stage: ShaderStage, source: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let directive = lines
        .iter()
        .position(|line| !is_comment_or_blank(line))
        .filter(|index| lines[*index].trim_start().starts_with("#version"));

    let header = match directive {
        Some(index) => {
            let tokens: Vec<&str> = lines[index].split_whitespace().collect();
            if tokens.last() == Some(&"es") {
                lines[index].trim().to_string()
            } else {
                TARGET_VERSION.to_string()
            }
        }
        None => TARGET_VERSION.to_string(),
    };

    let body: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index) != directive)
        .map(|(_, line)| *line)
        .collect();
    // `#extension` must precede every non-preprocessor token, so precision
    // goes after the leading run of unconditional directives.
    let precision_at = if stage == ShaderStage::Fragment && !declares_float_precision(source) {
        let leading = body
            .iter()
            .take_while(|line| is_comment_or_blank(line) || is_leading_directive(line))
            .count();
        Some(
            body[..leading]
                .iter()
                .rposition(|line| is_leading_directive(line))
                .map_or(0, |index| index + 1),
        )
    } else {
        None
    };

    let mut output = String::with_capacity(source.len() + 64);
    output.push_str(&header);
    output.push('\n');
    for (index, line) in body.iter().enumerate() {
        if precision_at == Some(index) {
            output.push_str("precision highp float;\n");
        }
        output.push_str(line);
        output.push('\n');
    }
    if precision_at == Some(body.len()) {
        output.push_str("precision highp float;\n");
    }
    output
}

fn is_leading_directive(line: &str) -> bool {
    let line = line.trim_start();
    ["#extension", "#define", "#undef", "#pragma", "#line"]
        .iter()
        .any(|directive| line.starts_with(directive))
}

/// Compiles a single stage after normalising its dialect.
pub fn compile<G: Gpu>(gpu: &G, stage: ShaderStage, source: &str) -> Result<ShaderId, ProgramError> {
    let transformed = normalize_dialect(stage, source);
    let shader = gpu
        .create_shader(stage)
        .map_err(|reason| ProgramError::CreateObject {
            object: "shader",
            reason,
        })?;
    gpu.shader_source(shader, &transformed);
    gpu.compile_shader(shader);
    if !gpu.shader_compile_status(shader) {
        let log = gpu.shader_info_log(shader);
        gpu.delete_shader(shader);
        return Err(ProgramError::Compile {
            stage,
            log,
            transformed_source: transformed,
        });
    }
    Ok(shader)
}

/// Links two compiled stages. The stage objects are released either way.
pub fn link<G: Gpu>(
    gpu: &G,
    vertex: ShaderId,
    fragment: ShaderId,
) -> Result<ProgramId, ProgramError> {
    let program = match gpu.create_program() {
        Ok(program) => program,
        Err(reason) => {
            gpu.delete_shader(vertex);
            gpu.delete_shader(fragment);
            return Err(ProgramError::CreateObject {
                object: "program",
                reason,
            });
        }
    };
    gpu.attach_shader(program, vertex);
    gpu.attach_shader(program, fragment);
    gpu.link_program(program);
    let linked = gpu.program_link_status(program);
    let log = if linked {
        String::new()
    } else {
        gpu.program_info_log(program)
    };
    gpu.detach_shader(program, vertex);
    gpu.detach_shader(program, fragment);
    gpu.delete_shader(vertex);
    gpu.delete_shader(fragment);
    if !linked {
        gpu.delete_program(program);
        return Err(ProgramError::Link { log });
    }
    Ok(program)
}

/// Compiles both stages and links them into a [`GraphicsProgram`].
pub fn build<G: Gpu>(
    gpu: &G,
    vertex_source: &str,
    fragment_source: &str,
) -> Result<GraphicsProgram, ProgramError> {
    let vertex = compile(gpu, ShaderStage::Vertex, vertex_source)?;
    let fragment = match compile(gpu, ShaderStage::Fragment, fragment_source) {
        Ok(fragment) => fragment,
        Err(err) => {
            gpu.delete_shader(vertex);
            return Err(err);
        }
    };
    let program = link(gpu, vertex, fragment)?;
    Ok(GraphicsProgram::new(gpu, program))
}

/// Builds a fragment program against the built-in full-screen vertex stage.
pub fn build_fragment<G: Gpu>(
    gpu: &G,
    fragment_source: &str,
) -> Result<GraphicsProgram, ProgramError> {
    build(gpu, BUILTIN_VERTEX, fragment_source)
}

/// A linked program plus its uniform-location cache.
#[derive(Debug)]
pub struct GraphicsProgram {
    id: ProgramId,
    time: Option<UniformLocation>,
    resolution: Option<UniformLocation>,
    uniforms: RefCell<HashMap<String, Option<UniformLocation>>>,
}

impl GraphicsProgram {
    fn new<G: Gpu>(gpu: &G, id: ProgramId) -> Self {
        Self {
            id,
            time: gpu.uniform_location(id, "u_time"),
            resolution: gpu.uniform_location(id, "u_resolution"),
            uniforms: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn bind<G: Gpu>(&self, gpu: &G) {
        gpu.use_program(Some(self.id));
    }

    /// Looks up `name`, caching hits and misses alike.
    pub fn uniform<G: Gpu>(&self, gpu: &G, name: &str) -> Option<UniformLocation> {
        if let Some(cached) = self.uniforms.borrow().get(name) {
            return *cached;
        }
        let location = gpu.uniform_location(self.id, name);
        self.uniforms
            .borrow_mut()
            .insert(name.to_string(), location);
        location
    }

    /// Writes `u_time` and `u_resolution`. The program must be bound.
    pub fn set_frame_uniforms<G: Gpu>(&self, gpu: &G, time: f32, width: u32, height: u32) {
        if let Some(location) = self.time {
            gpu.uniform_1_f32(location, time);
        }
        if let Some(location) = self.resolution {
            gpu.uniform_2_f32(location, width as f32, height as f32);
        }
    }

    pub fn set_f32<G: Gpu>(&self, gpu: &G, name: &str, value: f32) {
        if let Some(location) = self.uniform(gpu, name) {
            gpu.uniform_1_f32(location, value);
        }
    }

    /// Points sampler `name` at texture unit `unit`.
    pub fn set_sampler<G: Gpu>(&self, gpu: &G, name: &str, unit: u32) {
        if let Some(location) = self.uniform(gpu, name) {
            gpu.uniform_1_i32(location, unit as i32);
        }
    }

    pub fn destroy<G: Gpu>(self, gpu: &G) {
        gpu.delete_program(self.id);
    }
}
