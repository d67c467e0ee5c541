//! CPU-simulated [`Gpu`] used by unit tests.
//!
//! Programs are not interpreted. Instead each test registers a *kernel*, a
//! Rust closure computing one output pixel, keyed by a marker substring of
//! the fragment source. Drawing runs the kernel of the first marker found in
//! the current program's fragment source over every pixel of the bound
//! target. The built-in passthrough and fallback programs come pre-registered.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::rc::Rc;

use super::{
    FramebufferId, Gpu, ProgramId, ShaderId, ShaderStage, TextureId, UniformLocation,
    VertexArrayId, FRAMEBUFFER_COMPLETE,
};

pub(crate) type Rgba = [f32; 4];
type Kernel = Rc<dyn Fn(&Fragment<'_>) -> Rgba>;

/// Returned by `check_framebuffer_status` for a framebuffer without a
/// colour attachment.
pub(crate) const FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT: u32 = 0x8CD7;

#[derive(Debug, Clone, Default)]
pub(crate) struct Image {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<Rgba>,
}

impl Image {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0; 4]; width * height],
        }
    }

    fn fill(&mut self, color: Rgba) {
        self.pixels.iter_mut().for_each(|pixel| *pixel = color);
    }

    fn sample(&self, u: f32, v: f32) -> Rgba {
        if self.width == 0 || self.height == 0 {
            return [0.0; 4];
        }
        let x = ((u * self.width as f32).floor() as isize).clamp(0, self.width as isize - 1);
        let y = ((v * self.height as f32).floor() as isize).clamp(0, self.height as isize - 1);
        self.pixels[y as usize * self.width + x as usize]
    }
}

struct FakeShader {
    stage: ShaderStage,
    source: String,
    compiled: bool,
}

#[derive(Default)]
struct FakeProgram {
    attached: Vec<u32>,
    linked: bool,
    fragment_source: String,
    locations: HashMap<String, u32>,
    floats: HashMap<u32, Vec<f32>>,
    ints: HashMap<u32, i32>,
}

impl FakeProgram {
    fn location(&self, name: &str) -> Option<u32> {
        self.locations.get(name).copied()
    }
}

#[derive(Default)]
struct State {
    next_id: u32,
    shaders: HashMap<u32, FakeShader>,
    programs: HashMap<u32, FakeProgram>,
    textures: HashMap<u32, Image>,
    framebuffers: HashMap<u32, Option<u32>>,
    vertex_arrays: Vec<u32>,
    screen: Image,
    bound_framebuffer: Option<u32>,
    active_unit: u32,
    units: HashMap<u32, u32>,
    current_program: Option<u32>,
    bound_vertex_array: Option<u32>,
    clears: HashMap<Option<u32>, usize>,
    draws: usize,
    deleted_programs: usize,
    deleted_textures: usize,
    incomplete_framebuffers: bool,
}

impl State {
    fn allocate(&mut self) -> NonZeroU32 {
        self.next_id += 1;
        NonZeroU32::new(self.next_id).unwrap_or(NonZeroU32::MIN)
    }

    fn bound_image_mut(&mut self) -> Option<&mut Image> {
        match self.bound_framebuffer {
            None => Some(&mut self.screen),
            Some(fb) => {
                let texture = self.framebuffers.get(&fb).copied().flatten()?;
                self.textures.get_mut(&texture)
            }
        }
    }

    fn bound_image(&self) -> Option<&Image> {
        match self.bound_framebuffer {
            None => Some(&self.screen),
            Some(fb) => {
                let texture = self.framebuffers.get(&fb).copied().flatten()?;
                self.textures.get(&texture)
            }
        }
    }
}

/// Inputs available to a kernel for one output pixel.
pub(crate) struct Fragment<'a> {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    program: &'a FakeProgram,
    state: &'a State,
}

impl Fragment<'_> {
    pub fn uv(&self) -> (f32, f32) {
        (self.x / self.width, self.y / self.height)
    }

    pub fn float(&self, name: &str) -> f32 {
        self.program
            .location(name)
            .and_then(|location| self.program.floats.get(&location))
            .and_then(|values| values.first().copied())
            .unwrap_or(0.0)
    }

    /// Samples the texture bound to the unit the named sampler points at.
    pub fn sample(&self, sampler: &str, u: f32, v: f32) -> Rgba {
        let unit = self
            .program
            .location(sampler)
            .and_then(|location| self.program.ints.get(&location).copied())
            .unwrap_or(0) as u32;
        self.state
            .units
            .get(&unit)
            .and_then(|texture| self.state.textures.get(texture))
            .map(|image| image.sample(u, v))
            .unwrap_or([0.0; 4])
    }
}

pub(crate) struct FakeGpu {
    state: RefCell<State>,
    kernels: RefCell<Vec<(String, Kernel)>>,
}

impl FakeGpu {
    pub fn new() -> Self {
        let gpu = Self {
            state: RefCell::new(State::default()),
            kernels: RefCell::new(Vec::new()),
        };
        gpu.register("u_flip_y", |frag| {
            let (u, v) = frag.uv();
            let flip = frag.float("u_flip_y");
            let v = v + (1.0 - 2.0 * v) * flip;
            frag.sample("u_texture", u, v)
        });
        gpu.register("fallback gradient", |frag| {
            let (u, v) = frag.uv();
            [u, v, 0.5, 1.0]
        });
        gpu
    }

    /// Registers a kernel for programs whose fragment source contains `marker`.
    pub fn register<F>(&self, marker: &str, kernel: F)
    where
        F: Fn(&Fragment<'_>) -> Rgba + 'static,
    {
        self.kernels
            .borrow_mut()
            .insert(0, (marker.to_string(), Rc::new(kernel)));
    }

    /// Makes every framebuffer report a missing attachment.
    pub fn force_incomplete_framebuffers(&self, incomplete: bool) {
        self.state.borrow_mut().incomplete_framebuffers = incomplete;
    }

    pub fn screen(&self) -> Image {
        self.state.borrow().screen.clone()
    }

    pub fn screen_pixel(&self, x: usize, y: usize) -> Rgba {
        let state = self.state.borrow();
        state.screen.pixels[y * state.screen.width + x]
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(usize, usize)> {
        self.state
            .borrow()
            .textures
            .get(&texture.get())
            .map(|image| (image.width, image.height))
    }

    pub fn texture_image(&self, texture: TextureId) -> Option<Image> {
        self.state.borrow().textures.get(&texture.get()).cloned()
    }

    pub fn texture_exists(&self, texture: TextureId) -> bool {
        self.state.borrow().textures.contains_key(&texture.get())
    }

    pub fn live_textures(&self) -> usize {
        self.state.borrow().textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.borrow().programs.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.state.borrow().shaders.len()
    }

    pub fn live_vertex_arrays(&self) -> usize {
        self.state.borrow().vertex_arrays.len()
    }

    pub fn deleted_programs(&self) -> usize {
        self.state.borrow().deleted_programs
    }

    pub fn deleted_textures(&self) -> usize {
        self.state.borrow().deleted_textures
    }

    pub fn clear_count(&self, framebuffer: Option<FramebufferId>) -> usize {
        self.state
            .borrow()
            .clears
            .get(&framebuffer.map(FramebufferId::get))
            .copied()
            .unwrap_or(0)
    }

    pub fn draw_count(&self) -> usize {
        self.state.borrow().draws
    }

    fn kernel_for(&self, source: &str) -> Option<Kernel> {
        self.kernels
            .borrow()
            .iter()
            .find(|(marker, _)| source.contains(marker.as_str()))
            .map(|(_, kernel)| kernel.clone())
    }
}

fn declared_identifiers(source: &str) -> Vec<String> {
    source
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| token.starts_with("u_"))
        .map(str::to_string)
        .collect()
}

impl Gpu for FakeGpu {
    fn create_shader(&self, stage: ShaderStage) -> Result<ShaderId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.shaders.insert(
            id.get(),
            FakeShader {
                stage,
                source: String::new(),
                compiled: false,
            },
        );
        Ok(ShaderId(id))
    }

    fn shader_source(&self, shader: ShaderId, source: &str) {
        if let Some(entry) = self.state.borrow_mut().shaders.get_mut(&shader.get()) {
            entry.source = source.to_string();
        }
    }

    fn compile_shader(&self, shader: ShaderId) {
        if let Some(entry) = self.state.borrow_mut().shaders.get_mut(&shader.get()) {
            entry.compiled =
                entry.source.starts_with("#version") && entry.source.contains("void main");
        }
    }

    fn shader_compile_status(&self, shader: ShaderId) -> bool {
        self.state
            .borrow()
            .shaders
            .get(&shader.get())
            .map(|entry| entry.compiled)
            .unwrap_or(false)
    }

    fn shader_info_log(&self, shader: ShaderId) -> String {
        match self.state.borrow().shaders.get(&shader.get()) {
            Some(entry) if !entry.compiled => {
                "ERROR: 0:1: 'main' : function not defined".to_string()
            }
            _ => String::new(),
        }
    }

    fn delete_shader(&self, shader: ShaderId) {
        self.state.borrow_mut().shaders.remove(&shader.get());
    }

    fn create_program(&self) -> Result<ProgramId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.programs.insert(id.get(), FakeProgram::default());
        Ok(ProgramId(id))
    }

    fn attach_shader(&self, program: ProgramId, shader: ShaderId) {
        if let Some(entry) = self.state.borrow_mut().programs.get_mut(&program.get()) {
            entry.attached.push(shader.get());
        }
    }

    fn detach_shader(&self, program: ProgramId, shader: ShaderId) {
        if let Some(entry) = self.state.borrow_mut().programs.get_mut(&program.get()) {
            entry.attached.retain(|id| *id != shader.get());
        }
    }

    fn link_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        let stages: Vec<(ShaderStage, bool, String)> = match state.programs.get(&program.get()) {
            Some(entry) => entry
                .attached
                .iter()
                .filter_map(|id| state.shaders.get(id))
                .map(|shader| (shader.stage, shader.compiled, shader.source.clone()))
                .collect(),
            None => return,
        };
        let has_vertex = stages
            .iter()
            .any(|(stage, ok, _)| *stage == ShaderStage::Vertex && *ok);
        let fragment = stages
            .iter()
            .find(|(stage, ok, _)| *stage == ShaderStage::Fragment && *ok)
            .map(|(_, _, source)| source.clone());
        if let Some(entry) = state.programs.get_mut(&program.get()) {
            match fragment {
                Some(source) if has_vertex && !source.contains("force link failure") => {
                    entry.locations = declared_identifiers(&source)
                        .into_iter()
                        .enumerate()
                        .map(|(index, name)| (name, index as u32))
                        .collect();
                    entry.fragment_source = source;
                    entry.linked = true;
                }
                _ => entry.linked = false,
            }
        }
    }

    fn program_link_status(&self, program: ProgramId) -> bool {
        self.state
            .borrow()
            .programs
            .get(&program.get())
            .map(|entry| entry.linked)
            .unwrap_or(false)
    }

    fn program_info_log(&self, program: ProgramId) -> String {
        if self.program_link_status(program) {
            String::new()
        } else {
            "error: linking failed".to_string()
        }
    }

    fn delete_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        if state.programs.remove(&program.get()).is_some() {
            state.deleted_programs += 1;
        }
        if state.current_program == Some(program.get()) {
            state.current_program = None;
        }
    }

    fn use_program(&self, program: Option<ProgramId>) {
        self.state.borrow_mut().current_program = program.map(ProgramId::get);
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.state
            .borrow()
            .programs
            .get(&program.get())
            .and_then(|entry| entry.location(name))
            .map(UniformLocation)
    }

    fn uniform_1_f32(&self, location: UniformLocation, value: f32) {
        let mut state = self.state.borrow_mut();
        if let Some(current) = state.current_program {
            if let Some(entry) = state.programs.get_mut(&current) {
                entry.floats.insert(location.0, vec![value]);
            }
        }
    }

    fn uniform_2_f32(&self, location: UniformLocation, x: f32, y: f32) {
        let mut state = self.state.borrow_mut();
        if let Some(current) = state.current_program {
            if let Some(entry) = state.programs.get_mut(&current) {
                entry.floats.insert(location.0, vec![x, y]);
            }
        }
    }

    fn uniform_1_i32(&self, location: UniformLocation, value: i32) {
        let mut state = self.state.borrow_mut();
        if let Some(current) = state.current_program {
            if let Some(entry) = state.programs.get_mut(&current) {
                entry.ints.insert(location.0, value);
            }
        }
    }

    fn create_texture(&self) -> Result<TextureId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.textures.insert(id.get(), Image::default());
        Ok(TextureId(id))
    }

    fn delete_texture(&self, texture: TextureId) {
        let mut state = self.state.borrow_mut();
        if state.textures.remove(&texture.get()).is_some() {
            state.deleted_textures += 1;
        }
        state.units.retain(|_, bound| *bound != texture.get());
    }

    fn active_texture(&self, unit: u32) {
        self.state.borrow_mut().active_unit = unit;
    }

    fn bind_texture(&self, texture: Option<TextureId>) {
        let mut state = self.state.borrow_mut();
        let unit = state.active_unit;
        match texture {
            Some(texture) => {
                state.units.insert(unit, texture.get());
            }
            None => {
                state.units.remove(&unit);
            }
        }
    }

    fn tex_parameter(&self, _parameter: u32, _value: i32) {}

    fn tex_image_rgba(&self, width: i32, height: i32, pixels: Option<&[u8]>) {
        let mut state = self.state.borrow_mut();
        let unit = state.active_unit;
        let Some(texture) = state.units.get(&unit).copied() else {
            return;
        };
        let mut image = Image::new(width.max(0) as usize, height.max(0) as usize);
        if let Some(bytes) = pixels {
            upload(&mut image, bytes);
        }
        state.textures.insert(texture, image);
    }

    fn tex_sub_image_rgba(&self, _width: i32, _height: i32, pixels: &[u8]) {
        let mut state = self.state.borrow_mut();
        let unit = state.active_unit;
        let Some(texture) = state.units.get(&unit).copied() else {
            return;
        };
        if let Some(image) = state.textures.get_mut(&texture) {
            upload(image, pixels);
        }
    }

    fn create_framebuffer(&self) -> Result<FramebufferId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.framebuffers.insert(id.get(), None);
        Ok(FramebufferId(id))
    }

    fn delete_framebuffer(&self, framebuffer: FramebufferId) {
        let mut state = self.state.borrow_mut();
        state.framebuffers.remove(&framebuffer.get());
        if state.bound_framebuffer == Some(framebuffer.get()) {
            state.bound_framebuffer = None;
        }
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferId>) {
        self.state.borrow_mut().bound_framebuffer = framebuffer.map(FramebufferId::get);
    }

    fn framebuffer_texture(&self, texture: Option<TextureId>) {
        let mut state = self.state.borrow_mut();
        if let Some(fb) = state.bound_framebuffer {
            state
                .framebuffers
                .insert(fb, texture.map(TextureId::get));
        }
    }

    fn check_framebuffer_status(&self) -> u32 {
        let state = self.state.borrow();
        match state.bound_framebuffer {
            None => FRAMEBUFFER_COMPLETE,
            Some(_) if state.incomplete_framebuffers => FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT,
            Some(fb) => match state.framebuffers.get(&fb).copied().flatten() {
                Some(texture) if state.textures.contains_key(&texture) => FRAMEBUFFER_COMPLETE,
                _ => FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT,
            },
        }
    }

    fn create_vertex_array(&self) -> Result<VertexArrayId, String> {
        let mut state = self.state.borrow_mut();
        let id = state.allocate();
        state.vertex_arrays.push(id.get());
        Ok(VertexArrayId(id))
    }

    fn bind_vertex_array(&self, vertex_array: Option<VertexArrayId>) {
        self.state.borrow_mut().bound_vertex_array = vertex_array.map(VertexArrayId::get);
    }

    fn delete_vertex_array(&self, vertex_array: VertexArrayId) {
        self.state
            .borrow_mut()
            .vertex_arrays
            .retain(|id| *id != vertex_array.get());
    }

    fn viewport(&self, _x: i32, _y: i32, width: i32, height: i32) {
        let mut state = self.state.borrow_mut();
        let (w, h) = (width.max(0) as usize, height.max(0) as usize);
        if state.bound_framebuffer.is_none()
            && (state.screen.width != w || state.screen.height != h)
        {
            state.screen = Image::new(w, h);
        }
    }

    fn clear(&self, color: [f32; 4]) {
        let mut state = self.state.borrow_mut();
        let key = state.bound_framebuffer;
        *state.clears.entry(key).or_insert(0) += 1;
        if let Some(image) = state.bound_image_mut() {
            image.fill(color);
        }
    }

    fn draw_triangles(&self, _vertex_count: i32) {
        let output = {
            let state = self.state.borrow();
            if state.bound_vertex_array.is_none() {
                return;
            }
            let Some(program) = state.current_program.and_then(|id| state.programs.get(&id))
            else {
                return;
            };
            let Some(kernel) = self.kernel_for(&program.fragment_source) else {
                return;
            };
            let Some(target) = state.bound_image() else {
                return;
            };
            let (width, height) = (target.width, target.height);
            let mut pixels = Vec::with_capacity(width * height);
            for y in 0..height {
                for x in 0..width {
                    let fragment = Fragment {
                        x: x as f32 + 0.5,
                        y: y as f32 + 0.5,
                        width: width as f32,
                        height: height as f32,
                        program,
                        state: &state,
                    };
                    pixels.push(kernel(&fragment));
                }
            }
            pixels
        };
        let mut state = self.state.borrow_mut();
        state.draws += 1;
        if let Some(image) = state.bound_image_mut() {
            image.pixels = output;
        }
    }

    fn read_pixels_rgba(&self, width: i32, height: i32, out: &mut [u8]) {
        let state = self.state.borrow();
        let Some(image) = state.bound_image() else {
            return;
        };
        let (width, height) = (width.max(0) as usize, height.max(0) as usize);
        for y in 0..height.min(image.height) {
            for x in 0..width.min(image.width) {
                let pixel = image.pixels[y * image.width + x];
                let offset = (y * width + x) * 4;
                for channel in 0..4 {
                    out[offset + channel] = (pixel[channel].clamp(0.0, 1.0) * 255.0).round() as u8;
                }
            }
        }
    }
}

fn upload(image: &mut Image, bytes: &[u8]) {
    for (pixel, chunk) in image.pixels.iter_mut().zip(bytes.chunks_exact(4)) {
        *pixel = [
            chunk[0] as f32 / 255.0,
            chunk[1] as f32 / 255.0,
            chunk[2] as f32 / 255.0,
            chunk[3] as f32 / 255.0,
        ];
    }
}
