//! Static interface over the native graphics API.
//!
//! Every other module talks to the GPU through [`Gpu`]; only
//! [`resolve::GlowGpu`] knows that the underlying functions are looked up by
//! name at runtime. Handles are plain non-zero integers so the trait stays
//! object-agnostic and the CPU-backed test double can hand out its own ids.

pub mod resolve;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::num::NonZeroU32;

pub use glow::{
    CLAMP_TO_EDGE, FRAMEBUFFER_COMPLETE, LINEAR, TEXTURE_MAG_FILTER, TEXTURE_MIN_FILTER,
    TEXTURE_WRAP_S, TEXTURE_WRAP_T,
};
pub use resolve::{resolve, verify_entry_points, GlowGpu, ResolveError, REQUIRED_ENTRY_POINTS};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub NonZeroU32);

        impl $name {
            pub fn get(self) -> u32 {
                self.0.get()
            }
        }
    };
}

gpu_handle!(
    /// Compiled (or failed) shader stage object.
    ShaderId
);
gpu_handle!(
    /// Linked program object.
    ProgramId
);
gpu_handle!(TextureId);
gpu_handle!(FramebufferId);
gpu_handle!(VertexArrayId);

/// Location of a uniform inside a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Every native operation the pipeline relies on.
///
/// Implementations assume the calling thread owns a current graphics
/// context. Textures are always `TEXTURE_2D` RGBA8 and framebuffer calls
/// always target `FRAMEBUFFER` with a single colour attachment, which keeps
/// the surface small enough to simulate on the CPU.
pub trait Gpu {
    fn create_shader(&self, stage: ShaderStage) -> Result<ShaderId, String>;
    fn shader_source(&self, shader: ShaderId, source: &str);
    fn compile_shader(&self, shader: ShaderId);
    fn shader_compile_status(&self, shader: ShaderId) -> bool;
    fn shader_info_log(&self, shader: ShaderId) -> String;
    fn delete_shader(&self, shader: ShaderId);

    fn create_program(&self) -> Result<ProgramId, String>;
    fn attach_shader(&self, program: ProgramId, shader: ShaderId);
    fn detach_shader(&self, program: ProgramId, shader: ShaderId);
    fn link_program(&self, program: ProgramId);
    fn program_link_status(&self, program: ProgramId) -> bool;
    fn program_info_log(&self, program: ProgramId) -> String;
    fn delete_program(&self, program: ProgramId);
    fn use_program(&self, program: Option<ProgramId>);

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation>;
    fn uniform_1_f32(&self, location: UniformLocation, value: f32);
    fn uniform_2_f32(&self, location: UniformLocation, x: f32, y: f32);
    fn uniform_1_i32(&self, location: UniformLocation, value: i32);

    fn create_texture(&self) -> Result<TextureId, String>;
    fn delete_texture(&self, texture: TextureId);
    /// Selects texture unit `unit` (0-based) for subsequent binds.
    fn active_texture(&self, unit: u32);
    fn bind_texture(&self, texture: Option<TextureId>);
    fn tex_parameter(&self, parameter: u32, value: i32);
    /// Allocates storage for the bound texture, optionally uploading pixels.
    fn tex_image_rgba(&self, width: i32, height: i32, pixels: Option<&[u8]>);
    fn tex_sub_image_rgba(&self, width: i32, height: i32, pixels: &[u8]);

    fn create_framebuffer(&self) -> Result<FramebufferId, String>;
    fn delete_framebuffer(&self, framebuffer: FramebufferId);
    /// `None` binds the default (screen) framebuffer.
    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>);
    fn framebuffer_texture(&self, texture: Option<TextureId>);
    fn check_framebuffer_status(&self) -> u32;

    fn create_vertex_array(&self) -> Result<VertexArrayId, String>;
    fn bind_vertex_array(&self, vertex_array: Option<VertexArrayId>);
    fn delete_vertex_array(&self, vertex_array: VertexArrayId);

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32);
    /// Clears the colour buffer of the bound framebuffer.
    fn clear(&self, color: [f32; 4]);
    fn draw_triangles(&self, vertex_count: i32);
    /// Reads the bound framebuffer into `out` as bottom-up RGBA8 rows.
    fn read_pixels_rgba(&self, width: i32, height: i32, out: &mut [u8]);
}
