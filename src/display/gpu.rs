//! WebGPU backend: one surface per SDL window, sharing a single device
//!
//! Each surface owns its swapchain, a texture per eye and the bind group that
//! samples them. The device, queue, shader and sampler are shared and released
//! once, after every surface has been torn down on its own worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use wgpu::*;

use crate::capture::exchange::{FrameView, StereoReader};
use crate::capture::frame::{Eye, FrameFormat};
use crate::display::fence::{FenceStatus, GpuFence, SkippedFence};
use crate::display::window::{SdlHost, SurfaceSize};
use crate::display::{assemble, check_upload, RenderBackend, SharedResources, SurfaceRenderer};
use crate::error::DisplayError;
use crate::{DisplayConfig, RenderMode};

const SHADER: &str = r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOut {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
    );
    let p = corners[index];
    var out: VertexOut;
    out.position = vec4<f32>(p, 0.0, 1.0);
    out.uv = vec2<f32>((p.x + 1.0) * 0.5, (1.0 - p.y) * 0.5);
    return out;
}

@group(0) @binding(0) var left_eye: texture_2d<f32>;
@group(0) @binding(1) var right_eye: texture_2d<f32>;
@group(0) @binding(2) var eye_sampler: sampler;

// Left eye fills the left half of the surface, right eye the right half.
@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    let uv = vec2<f32>(fract(in.uv.x * 2.0), in.uv.y);
    let left = textureSample(left_eye, eye_sampler, uv);
    let right = textureSample(right_eye, eye_sampler, uv);
    return select(right, left, in.uv.x < 0.5);
}
"#;

/// Device-wide objects every surface renders with
pub struct GpuShared {
    device: Device,
    queue: Queue,
    shader: ShaderModule,
    layout: BindGroupLayout,
    pipeline_layout: PipelineLayout,
    sampler: Sampler,
    device_lost: Arc<AtomicBool>,
    released: AtomicBool,
}

impl GpuShared {
    fn new(device: Device, queue: Queue) -> Self {
        let device_lost = Arc::new(AtomicBool::new(false));
        {
            let lost = device_lost.clone();
            device.set_device_lost_callback(move |reason, message| {
                error!(?reason, %message, "GPU device lost");
                lost.store(true, Ordering::SeqCst);
            });
        }

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("Stereo Shader"),
            source: ShaderSource::Wgsl(SHADER.into()),
        });

        let texture_entry = |binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::FRAGMENT,
            ty: BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: true },
                view_dimension: TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Stereo Bind Group Layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Stereo Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("Eye Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        Self {
            device,
            queue,
            shader,
            layout,
            pipeline_layout,
            sampler,
            device_lost,
            released: AtomicBool::new(false),
        }
    }

    fn is_lost(&self) -> bool {
        self.device_lost.load(Ordering::SeqCst)
    }

    fn create_pipeline(&self, format: TextureFormat) -> RenderPipeline {
        self.device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Stereo Pipeline"),
            layout: Some(&self.pipeline_layout),
            cache: None,
            vertex: VertexState {
                module: &self.shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(FragmentState {
                module: &self.shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState {
                    format,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        })
    }

    fn create_eye_texture(&self, eye: Eye, frame: FrameFormat) -> Texture {
        self.device.create_texture(&TextureDescriptor {
            label: Some(match eye {
                Eye::Left => "Left Eye Texture",
                Eye::Right => "Right Eye Texture",
            }),
            size: Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }
}

impl SharedResources for GpuShared {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("releasing shared GPU resources");
        self.device.destroy();
    }
}

/// Resolves once the queue has finished the work submitted before it
struct WgpuFence {
    shared: Arc<GpuShared>,
    done: Arc<AtomicBool>,
}

impl GpuFence for WgpuFence {
    fn status(&self) -> FenceStatus {
        if self.done.load(Ordering::SeqCst) {
            return FenceStatus::Signaled;
        }
        if self.shared.is_lost() {
            return FenceStatus::Failed("device lost".into());
        }
        let _ = self.shared.device.poll(Maintain::Poll);
        if self.done.load(Ordering::SeqCst) {
            FenceStatus::Signaled
        } else {
            FenceStatus::Pending
        }
    }
}

pub struct WgpuSurface {
    index: usize,
    shared: Arc<GpuShared>,
    surface: Option<Surface<'static>>,
    config: SurfaceConfiguration,
    size: Arc<SurfaceSize>,
    pipeline: RenderPipeline,
    textures: [Texture; 2],
    bind_group: BindGroup,
    frame: FrameFormat,
    rgba: Vec<u8>,
}

impl WgpuSurface {
    fn surface_error(&self, reason: impl ToString) -> DisplayError {
        DisplayError::Surface {
            surface: self.index,
            reason: reason.to_string(),
        }
    }

    fn apply_resize(&mut self, surface: &Surface<'static>) {
        let (width, height) = self.size.load();
        if (width, height) != (self.config.width, self.config.height) && width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            surface.configure(&self.shared.device, &self.config);
        }
    }
}

impl SurfaceRenderer for WgpuSurface {
    fn upload(&mut self, eye: Eye, frame: &FrameView<'_>) -> Result<(), DisplayError> {
        check_upload(eye, self.frame, frame)?;

        // Slots are packed RGB; the texture wants RGBA.
        for (dst, src) in self.rgba.chunks_exact_mut(4).zip(frame.chunks_exact(3)) {
            dst[..3].copy_from_slice(src);
            dst[3] = 255;
        }

        self.shared.queue.write_texture(
            ImageCopyTexture {
                texture: &self.textures[eye.index()],
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &self.rgba,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.frame.width),
                rows_per_image: Some(self.frame.height),
            },
            Extent3d {
                width: self.frame.width,
                height: self.frame.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn draw_and_present(&mut self) -> Result<Box<dyn GpuFence>, DisplayError> {
        if self.shared.is_lost() {
            return Err(self.surface_error("device lost"));
        }
        let surface = self.surface.take().ok_or(DisplayError::ShutDown)?;
        self.apply_resize(&surface);

        let output = match surface.get_current_texture() {
            Ok(output) => Ok(output),
            Err(SurfaceError::Outdated | SurfaceError::Lost) => {
                warn!(surface = self.index, "swapchain outdated, reconfiguring");
                surface.configure(&self.shared.device, &self.config);
                surface.get_current_texture()
            }
            Err(e) => Err(e),
        };
        let output = match output {
            Ok(output) => output,
            Err(SurfaceError::Timeout) => {
                warn!(surface = self.index, "swapchain timed out, skipping present");
                self.surface = Some(surface);
                return Ok(Box::new(SkippedFence));
            }
            Err(e) => {
                self.surface = Some(surface);
                return Err(self.surface_error(e));
            }
        };

        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());
        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Stereo Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Stereo Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &self.bind_group, &[]);
            render_pass.draw(0..6, 0..1);
        }

        self.shared.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            self.shared
                .queue
                .on_submitted_work_done(move || done.store(true, Ordering::SeqCst));
        }

        self.surface = Some(surface);
        Ok(Box::new(WgpuFence {
            shared: self.shared.clone(),
            done,
        }))
    }

    fn release(&mut self) {
        self.surface = None;
        for texture in &self.textures {
            texture.destroy();
        }
        info!(surface = self.index, "surface released");
    }
}

/// Opens the windows and GPU device and builds the configured backend.
#[instrument(skip_all, fields(surfaces = config.surfaces))]
pub fn initialize(
    config: &DisplayConfig,
    frame: FrameFormat,
    frames: StereoReader,
) -> Result<Box<dyn RenderBackend>, DisplayError> {
    let count = match config.mode {
        RenderMode::Single => 1,
        _ => config.surfaces,
    };
    let host = SdlHost::new(config, count)?;

    let instance = Instance::new(InstanceDescriptor {
        backends: Backends::all(),
        ..Default::default()
    });

    let mut surfaces = Vec::with_capacity(count);
    for (index, window) in host.windows().iter().enumerate() {
        // SAFETY: the windows live in `host`, which the backend keeps alive
        // for longer than any surface: surfaces are released on shutdown and
        // the host is dropped after the renderers.
        let surface = unsafe {
            let target = SurfaceTargetUnsafe::from_window(window)
                .map_err(|e| DisplayError::Init(format!("window {index} handle: {e}")))?;
            instance.create_surface_unsafe(target)
        }
        .map_err(|e| DisplayError::Init(format!("surface {index}: {e}")))?;
        surfaces.push(surface);
    }

    let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
        power_preference: PowerPreference::HighPerformance,
        compatible_surface: surfaces.first(),
        force_fallback_adapter: false,
    }))
    .ok_or_else(|| DisplayError::Init("no suitable GPU adapter found".into()))?;
    info!("GPU: {}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(
        &DeviceDescriptor {
            label: Some("Binocle GPU Device"),
            required_features: Features::empty(),
            required_limits: Limits::default(),
            memory_hints: Default::default(),
        },
        None,
    ))
    .map_err(|e| DisplayError::Init(e.to_string()))?;

    let shared = Arc::new(GpuShared::new(device, queue));

    let mut renderers = Vec::with_capacity(count);
    for (index, surface) in surfaces.into_iter().enumerate() {
        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| DisplayError::Init(format!("surface {index} has no formats")))?;
        let size = host
            .size_handle(index)
            .ok_or_else(|| DisplayError::Init(format!("no window for surface {index}")))?;
        let (width, height) = size.load();

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode: PresentMode::Fifo,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&shared.device, &surface_config);

        let textures = [
            shared.create_eye_texture(Eye::Left, frame),
            shared.create_eye_texture(Eye::Right, frame),
        ];
        let left = textures[0].create_view(&TextureViewDescriptor::default());
        let right = textures[1].create_view(&TextureViewDescriptor::default());
        let bind_group = shared.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Stereo Bind Group"),
            layout: &shared.layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&left),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&right),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Sampler(&shared.sampler),
                },
            ],
        });

        renderers.push(WgpuSurface {
            index,
            pipeline: shared.create_pipeline(format),
            shared: shared.clone(),
            surface: Some(surface),
            config: surface_config,
            size,
            textures,
            bind_group,
            frame,
            rgba: vec![0; frame.width as usize * frame.height as usize * 4],
        });
    }

    assemble(config, renderers, Box::new(host), shared, frames)
}
