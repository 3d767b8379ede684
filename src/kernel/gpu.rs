use crate::{
    foundation::{
        error::{StackedAlphaError, StackedAlphaResult},
        geometry::Geometry,
    },
    kernel::{BackendKind, CompositeConfig, CompositeKernel, check_frame},
    media::source::VideoFrame,
    pool::{ContextFactory, ContextPool, Lease},
    surface::{AlphaMode, Surface},
};

const SHADER: &str = r#"
struct VsOut {
  @builtin(position) pos: vec4<f32>,
};

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> VsOut {
  var p = array<vec2<f32>, 3>(
    vec2<f32>(-1.0, -1.0),
    vec2<f32>( 3.0, -1.0),
    vec2<f32>(-1.0,  3.0),
  );
  var o: VsOut;
  o.pos = vec4<f32>(p[vi], 0.0, 1.0);
  return o;
}

@group(0) @binding(0) var t_src: texture_2d<f32>;
// x: premultiply (0 or 1), y: half height in texels.
@group(0) @binding(1) var<uniform> params: vec4<f32>;

// Texel form of color at (u, v * 0.5) and alpha at (u, 0.5 + v * 0.5); exact for odd heights.
@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let xy = vec2<i32>(in.pos.xy);
  let half_h = i32(params.y);
  let color = textureLoad(t_src, xy, 0);
  let alpha = textureLoad(t_src, vec2<i32>(xy.x, half_h + xy.y), 0).r;
  return vec4<f32>(color.rgb * mix(1.0, alpha, params.x), alpha);
}
"#;

struct Targets {
    geometry: Geometry,
    source: wgpu::Texture,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    bind_group: wgpu::BindGroup,
    readback: wgpu::Buffer,
    readback_bytes_per_row: u32,
}

impl Targets {
    fn destroy(&self) {
        self.source.destroy();
        self.target.destroy();
        self.readback.destroy();
    }
}

/// A wgpu device with the stacked-alpha pipeline built on it.
///
/// Owned directly by [`GpuKernel`] or shared through a [`GpuContextPool`]. Sized resources are
/// (re)created only when the frame geometry changes.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    targets: Option<Targets>,
    target_allocations: u64,
}

impl GpuContext {
    /// Request an adapter and device and build the pipeline.
    ///
    /// Fails with [`StackedAlphaError::ContextUnavailable`] when no adapter or device can be
    /// obtained, and with [`StackedAlphaError::ShaderBuildFailed`] when the pipeline does not
    /// validate.
    #[tracing::instrument(level = "debug")]
    pub async fn new() -> StackedAlphaResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| match e {
                wgpu::RequestAdapterError::NotFound { .. } => {
                    StackedAlphaError::context_unavailable("no gpu adapter available")
                }
                other => StackedAlphaError::context_unavailable(format!(
                    "wgpu request_adapter failed: {other:?}"
                )),
            })?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("stacked_alpha_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| {
                StackedAlphaError::context_unavailable(format!("wgpu request_device failed: {e:?}"))
            })?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let (pipeline, bind_group_layout) = build_pipeline(&device);
        if let Some(err) = device.pop_error_scope().await {
            return Err(StackedAlphaError::shader_build_failed(err.to_string()));
        }

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stacked_alpha_params"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        tracing::debug!(adapter = ?adapter.get_info().name, "gpu context created");
        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            params,
            targets: None,
            target_allocations: 0,
        })
    }

    /// Composite one frame through a [`FrameSession`].
    ///
    /// A session that fails after submission may leave the readback buffer mid-map, so its sized
    /// resources are discarded and rebuilt by the next frame.
    pub fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()> {
        let result = self.begin_frame(frame, geometry, config)?.finish_into(dst);
        if let Err(err) = &result {
            tracing::debug!(error = %err, "gpu frame failed, discarding sized targets");
            self.discard_targets();
        }
        result
    }

    fn discard_targets(&mut self) {
        if let Some(targets) = self.targets.take() {
            targets.destroy();
        }
    }

    /// How many times sized GPU resources were allocated.
    pub fn target_allocations(&self) -> u64 {
        self.target_allocations
    }

    /// Open a frame session: upload `frame` and bind every piece of state the draw needs.
    ///
    /// Nothing bound by an earlier session (possibly another renderer's, on a shared context) is
    /// assumed to survive.
    pub fn begin_frame(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
    ) -> StackedAlphaResult<FrameSession<'_>> {
        check_frame(frame, geometry)?;
        self.ensure_targets(geometry)?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| StackedAlphaError::context_unavailable("gpu targets not initialized"))?;

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.rgba8,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(geometry.width * 4),
                rows_per_image: Some(geometry.full_height),
            },
            wgpu::Extent3d {
                width: geometry.width,
                height: geometry.full_height,
                depth_or_array_layers: 1,
            },
        );

        let premultiply: f32 = if config.premultiplied { 1.0 } else { 0.0 };
        let half = geometry.half_height as f32;
        let mut params = [0u8; 16];
        params[0..4].copy_from_slice(&premultiply.to_le_bytes());
        params[4..8].copy_from_slice(&half.to_le_bytes());
        self.queue.write_buffer(&self.params, 0, &params);

        Ok(FrameSession {
            device: &self.device,
            queue: &self.queue,
            pipeline: &self.pipeline,
            targets,
            alpha_mode: if config.premultiplied {
                AlphaMode::Premultiplied
            } else {
                AlphaMode::Straight
            },
        })
    }

    fn ensure_targets(&mut self, geometry: Geometry) -> StackedAlphaResult<()> {
        if self.targets.as_ref().map(|t| t.geometry) == Some(geometry) {
            return Ok(());
        }

        let max = self.device.limits().max_texture_dimension_2d;
        if geometry.width > max || geometry.full_height > max {
            return Err(StackedAlphaError::invalid_frame(format!(
                "{}x{} frame exceeds the device texture limit {max}",
                geometry.width, geometry.full_height
            )));
        }

        self.discard_targets();

        let source = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("stacked_alpha_source"),
            size: wgpu::Extent3d {
                width: geometry.width,
                height: geometry.full_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let source_view = source.create_view(&wgpu::TextureViewDescriptor::default());

        let target = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("stacked_alpha_target"),
            size: wgpu::Extent3d {
                width: geometry.width,
                height: geometry.half_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("stacked_alpha_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.params.as_entire_binding(),
                },
            ],
        });

        let readback_bytes_per_row = align_to(geometry.width * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stacked_alpha_readback"),
            size: (readback_bytes_per_row as u64) * (geometry.half_height as u64),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.targets = Some(Targets {
            geometry,
            source,
            target,
            target_view,
            bind_group,
            readback,
            readback_bytes_per_row,
        });
        self.target_allocations += 1;
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.discard_targets();
        self.params.destroy();
        tracing::debug!("gpu context destroyed");
    }
}

/// One fully bound draw on a [`GpuContext`]. Consumed by [`FrameSession::finish_into`].
pub struct FrameSession<'a> {
    device: &'a wgpu::Device,
    queue: &'a wgpu::Queue,
    pipeline: &'a wgpu::RenderPipeline,
    targets: &'a Targets,
    alpha_mode: AlphaMode,
}

impl FrameSession<'_> {
    /// Draw, read the result back and write it into `dst`.
    pub fn finish_into(self, dst: &mut Surface) -> StackedAlphaResult<()> {
        let t = self.targets;
        let g = t.geometry;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("stacked_alpha_encoder"),
            });
        {
            let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("stacked_alpha_rp"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &t.target_view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rp.set_pipeline(self.pipeline);
            rp.set_bind_group(0, &t.bind_group, &[]);
            rp.draw(0..3, 0..1);
        }
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &t.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &t.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(t.readback_bytes_per_row),
                    rows_per_image: Some(g.half_height),
                },
            },
            wgpu::Extent3d {
                width: g.width,
                height: g.half_height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = t.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| StackedAlphaError::invalid_frame(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| StackedAlphaError::invalid_frame("readback channel closed"))?
            .map_err(|e| StackedAlphaError::invalid_frame(format!("readback map failed: {e:?}")))?;

        dst.resize(g.width, g.half_height);
        {
            let mapped = buffer_slice.get_mapped_range();
            let row_bytes = (g.width as usize) * 4;
            let padded_row_bytes = t.readback_bytes_per_row as usize;
            for (row, out) in dst.pixels_mut().chunks_exact_mut(row_bytes).enumerate() {
                let start = row * padded_row_bytes;
                out.copy_from_slice(&mapped[start..start + row_bytes]);
            }
        }
        t.readback.unmap();
        dst.mark_presented(self.alpha_mode);
        Ok(())
    }
}

fn build_pipeline(device: &wgpu::Device) -> (wgpu::RenderPipeline, wgpu::BindGroupLayout) {
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("stacked_alpha_bgl"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(16),
                },
                count: None,
            },
        ],
    });

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("stacked_alpha_shader"),
        source: wgpu::ShaderSource::Wgsl(SHADER.into()),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("stacked_alpha_pl"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("stacked_alpha_pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: wgpu::TextureFormat::Rgba8Unorm,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });

    (pipeline, bind_group_layout)
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Kernel owning a private [`GpuContext`].
pub struct GpuKernel {
    context: Option<GpuContext>,
}

impl GpuKernel {
    /// Build a kernel on a fresh device. See [`GpuContext::new`] for failure modes.
    pub async fn new() -> StackedAlphaResult<Self> {
        Ok(Self {
            context: Some(GpuContext::new().await?),
        })
    }

    /// [`GpuKernel::new`], blocking the current thread.
    pub fn new_blocking() -> StackedAlphaResult<Self> {
        pollster::block_on(Self::new())
    }

    /// The device context, `None` after [`CompositeKernel::release`].
    pub fn context(&self) -> Option<&GpuContext> {
        self.context.as_ref()
    }
}

impl CompositeKernel for GpuKernel {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()> {
        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| StackedAlphaError::context_unavailable("gpu kernel released"))?;
        ctx.composite(frame, geometry, config, dst)
    }

    fn release(&mut self) {
        self.context = None;
    }
}

/// Creates [`GpuContext`]s for a [`GpuContextPool`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuContextFactory;

impl ContextFactory for GpuContextFactory {
    type Context = GpuContext;

    async fn create(&self) -> StackedAlphaResult<GpuContext> {
        GpuContext::new().await
    }

    fn label(&self) -> &'static str {
        "gpu"
    }
}

/// A pool sharing one wgpu device between many renderers.
pub type GpuContextPool = ContextPool<GpuContextFactory>;

/// Create an empty GPU context pool.
pub fn gpu_context_pool() -> GpuContextPool {
    ContextPool::new(GpuContextFactory)
}

/// Kernel drawing through a lease on a shared [`GpuContext`].
///
/// Results are read back into the caller's surface; the pool's targets are never exposed.
pub struct SharedGpuKernel {
    lease: Option<Lease<GpuContextFactory>>,
}

impl SharedGpuKernel {
    /// Lease the pool's context, creating it if needed.
    pub async fn new(pool: &GpuContextPool) -> StackedAlphaResult<Self> {
        Ok(Self {
            lease: Some(pool.acquire().await?),
        })
    }
}

impl CompositeKernel for SharedGpuKernel {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| StackedAlphaError::context_unavailable("gpu lease released"))?;
        lease.with(|ctx| ctx.composite(frame, geometry, config, dst))?
    }

    fn release(&mut self) {
        self.lease = None;
    }
}
