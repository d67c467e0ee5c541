use std::ffi::c_void;

use glow::HasContext;

use super::{
    FramebufferId, Gpu, ProgramId, ShaderId, ShaderStage, TextureId, UniformLocation,
    VertexArrayId,
};

/// Native symbols [`GlowGpu`] calls into. A context missing any of these
/// cannot drive the pipeline.
pub const REQUIRED_ENTRY_POINTS: &[&str] = &[
    "glActiveTexture",
    "glAttachShader",
    "glBindFramebuffer",
    "glBindTexture",
    "glBindVertexArray",
    "glCheckFramebufferStatus",
    "glClear",
    "glClearColor",
    "glCompileShader",
    "glCreateProgram",
    "glCreateShader",
    "glDeleteFramebuffers",
    "glDeleteProgram",
    "glDeleteShader",
    "glDeleteTextures",
    "glDeleteVertexArrays",
    "glDetachShader",
    "glDrawArrays",
    "glFramebufferTexture2D",
    "glGenFramebuffers",
    "glGenTextures",
    "glGenVertexArrays",
    "glGetProgramInfoLog",
    "glGetProgramiv",
    "glGetShaderInfoLog",
    "glGetShaderiv",
    "glGetString",
    "glGetUniformLocation",
    "glLinkProgram",
    "glReadPixels",
    "glShaderSource",
    "glTexImage2D",
    "glTexParameteri",
    "glTexSubImage2D",
    "glUniform1f",
    "glUniform1i",
    "glUniform2f",
    "glUseProgram",
    "glViewport",
];

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("graphics context is missing required entry points: {}", .0.join(", "))]
    MissingEntryPoints(Vec<&'static str>),
}

/// Probes every name in [`REQUIRED_ENTRY_POINTS`] once through `loader`.
pub fn verify_entry_points<F>(loader: &mut F) -> Result<(), ResolveError>
where
    F: FnMut(&str) -> *const c_void,
{
    let missing: Vec<&'static str> = REQUIRED_ENTRY_POINTS
        .iter()
        .copied()
        .filter(|name| loader(name).is_null())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ResolveError::MissingEntryPoints(missing))
    }
}

/// Builds the function table from a name-based loader.
///
/// # Safety
///
/// `loader` must return valid function pointers for the context that is
/// current on the calling thread, and that context must stay current for as
/// long as the returned [`GlowGpu`] is used.
pub unsafe fn resolve<F>(mut loader: F) -> Result<GlowGpu, ResolveError>
where
    F: FnMut(&str) -> *const c_void,
{
    verify_entry_points(&mut loader)?;
    let gl = glow::Context::from_loader_function(loader);
    let version = gl.get_parameter_string(glow::VERSION);
    let renderer = gl.get_parameter_string(glow::RENDERER);
    tracing::info!(%version, %renderer, "resolved graphics entry points");
    Ok(GlowGpu { gl, version })
}

/// [`Gpu`] implementation backed by `glow`.
pub struct GlowGpu {
    gl: glow::Context,
    version: String,
}

impl GlowGpu {
    pub fn version(&self) -> &str {
        &self.version
    }
}

fn native_shader(id: ShaderId) -> glow::NativeShader {
    glow::NativeShader(id.0)
}

fn native_program(id: ProgramId) -> glow::NativeProgram {
    glow::NativeProgram(id.0)
}

fn native_texture(id: TextureId) -> glow::NativeTexture {
    glow::NativeTexture(id.0)
}

fn native_uniform(location: UniformLocation) -> glow::NativeUniformLocation {
    glow::NativeUniformLocation(location.0)
}

// All calls below are sound as long as the invariant documented on
// `resolve` holds: the context is current on this thread.
impl Gpu for GlowGpu {
    fn create_shader(&self, stage: ShaderStage) -> Result<ShaderId, String> {
        let kind = match stage {
            ShaderStage::Vertex => glow::VERTEX_SHADER,
            ShaderStage::Fragment => glow::FRAGMENT_SHADER,
        };
        unsafe { self.gl.create_shader(kind) }.map(|shader| ShaderId(shader.0))
    }

    fn shader_source(&self, shader: ShaderId, source: &str) {
        unsafe { self.gl.shader_source(native_shader(shader), source) }
    }

    fn compile_shader(&self, shader: ShaderId) {
        unsafe { self.gl.compile_shader(native_shader(shader)) }
    }

    fn shader_compile_status(&self, shader: ShaderId) -> bool {
        unsafe { self.gl.get_shader_compile_status(native_shader(shader)) }
    }

    fn shader_info_log(&self, shader: ShaderId) -> String {
        unsafe { self.gl.get_shader_info_log(native_shader(shader)) }
    }

    fn delete_shader(&self, shader: ShaderId) {
        unsafe { self.gl.delete_shader(native_shader(shader)) }
    }

    fn create_program(&self) -> Result<ProgramId, String> {
        unsafe { self.gl.create_program() }.map(|program| ProgramId(program.0))
    }

    fn attach_shader(&self, program: ProgramId, shader: ShaderId) {
        unsafe {
            self.gl
                .attach_shader(native_program(program), native_shader(shader))
        }
    }

    fn detach_shader(&self, program: ProgramId, shader: ShaderId) {
        unsafe {
            self.gl
                .detach_shader(native_program(program), native_shader(shader))
        }
    }

    fn link_program(&self, program: ProgramId) {
        unsafe { self.gl.link_program(native_program(program)) }
    }

    fn program_link_status(&self, program: ProgramId) -> bool {
        unsafe { self.gl.get_program_link_status(native_program(program)) }
    }

    fn program_info_log(&self, program: ProgramId) -> String {
        unsafe { self.gl.get_program_info_log(native_program(program)) }
    }

    fn delete_program(&self, program: ProgramId) {
        unsafe { self.gl.delete_program(native_program(program)) }
    }

    fn use_program(&self, program: Option<ProgramId>) {
        unsafe { self.gl.use_program(program.map(native_program)) }
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        unsafe { self.gl.get_uniform_location(native_program(program), name) }
            .map(|location| UniformLocation(location.0))
    }

    fn uniform_1_f32(&self, location: UniformLocation, value: f32) {
        unsafe {
            self.gl
                .uniform_1_f32(Some(&native_uniform(location)), value)
        }
    }

    fn uniform_2_f32(&self, location: UniformLocation, x: f32, y: f32) {
        unsafe { self.gl.uniform_2_f32(Some(&native_uniform(location)), x, y) }
    }

    fn uniform_1_i32(&self, location: UniformLocation, value: i32) {
        unsafe {
            self.gl
                .uniform_1_i32(Some(&native_uniform(location)), value)
        }
    }

    fn create_texture(&self) -> Result<TextureId, String> {
        unsafe { self.gl.create_texture() }.map(|texture| TextureId(texture.0))
    }

    fn delete_texture(&self, texture: TextureId) {
        unsafe { self.gl.delete_texture(native_texture(texture)) }
    }

    fn active_texture(&self, unit: u32) {
        unsafe { self.gl.active_texture(glow::TEXTURE0 + unit) }
    }

    fn bind_texture(&self, texture: Option<TextureId>) {
        unsafe {
            self.gl
                .bind_texture(glow::TEXTURE_2D, texture.map(native_texture))
        }
    }

    fn tex_parameter(&self, parameter: u32, value: i32) {
        unsafe {
            self.gl
                .tex_parameter_i32(glow::TEXTURE_2D, parameter, value)
        }
    }

    fn tex_image_rgba(&self, width: i32, height: i32, pixels: Option<&[u8]>) {
        unsafe {
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                width,
                height,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(pixels),
            )
        }
    }

    fn tex_sub_image_rgba(&self, width: i32, height: i32, pixels: &[u8]) {
        unsafe {
            self.gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                width,
                height,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(pixels)),
            )
        }
    }

    fn create_framebuffer(&self) -> Result<FramebufferId, String> {
        unsafe { self.gl.create_framebuffer() }.map(|framebuffer| FramebufferId(framebuffer.0))
    }

    fn delete_framebuffer(&self, framebuffer: FramebufferId) {
        unsafe {
            self.gl
                .delete_framebuffer(glow::NativeFramebuffer(framebuffer.0))
        }
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>) {
        unsafe {
            self.gl.bind_framebuffer(
                glow::FRAMEBUFFER,
                framebuffer.map(|id| glow::NativeFramebuffer(id.0)),
            )
        }
    }

    fn framebuffer_texture(&self, texture: Option<TextureId>) {
        unsafe {
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                texture.map(native_texture),
                0,
            )
        }
    }

    fn check_framebuffer_status(&self) -> u32 {
        unsafe { self.gl.check_framebuffer_status(glow::FRAMEBUFFER) }
    }

    fn create_vertex_array(&self) -> Result<VertexArrayId, String> {
        unsafe { self.gl.create_vertex_array() }.map(|vao| VertexArrayId(vao.0))
    }

    fn bind_vertex_array(&self, vertex_array: Option<VertexArrayId>) {
        unsafe {
            self.gl
                .bind_vertex_array(vertex_array.map(|id| glow::NativeVertexArray(id.0)))
        }
    }

    fn delete_vertex_array(&self, vertex_array: VertexArrayId) {
        unsafe {
            self.gl
                .delete_vertex_array(glow::NativeVertexArray(vertex_array.0))
        }
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { self.gl.viewport(x, y, width, height) }
    }

    fn clear(&self, color: [f32; 4]) {
        unsafe {
            self.gl.clear_color(color[0], color[1], color[2], color[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn draw_triangles(&self, vertex_count: i32) {
        unsafe { self.gl.draw_arrays(glow::TRIANGLES, 0, vertex_count) }
    }

    fn read_pixels_rgba(&self, width: i32, height: i32, out: &mut [u8]) {
        unsafe {
            self.gl.read_pixels(
                0,
                0,
                width,
                height,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(out)),
            )
        }
    }
}
