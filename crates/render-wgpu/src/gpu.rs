use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpucull_core::{
    CommandStream, CullDevice, CullError, DeviceCommand, FrameUpload, IndirectDrawArgs,
    InstanceBounds, InstanceShading, MAX_LIGHTS, PipelineConfig, PipelineStatistics,
    PublishedFrame, QueryFetch, QuerySource,
};
use wgpu::util::DeviceExt;

use crate::context::HeadlessContext;
use crate::shaders;

/// Colour target format of the offscreen frame.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

const ARGS_SIZE: u64 = std::mem::size_of::<IndirectDrawArgs>() as u64;
const QUERY_RESULT_SIZE: u64 = std::mem::size_of::<u64>() as u64;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CullUniforms {
    planes: [[f32; 4]; 6],
    instance_count: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GpuLight {
    position: [f32; 4],
    color: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct DrawUniforms {
    view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    light_count: u32,
    _pad: [u32; 3],
    lights: [GpuLight; MAX_LIGHTS],
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct InstanceData {
    model: [[f32; 4]; 4],
    base_color: [f32; 4],
    params: [f32; 4],
}

impl InstanceData {
    fn new(model: &Mat4, shading: InstanceShading) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            base_color: shading.base_color,
            params: shading.params,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
}

/// Unit cube, 24 vertices and 36 indices (12 triangles).
fn cube_mesh() -> (Vec<Vertex>, Vec<u16>) {
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in FACES {
        let base = vertices.len() as u16;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let position = [
                normal[0] * 0.5 + u[0] * su + v[0] * sv,
                normal[1] * 0.5 + u[1] * su + v[1] * sv,
                normal[2] * 0.5 + u[2] * su + v[2] * sv,
            ];
            vertices.push(Vertex { position, normal });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    (vertices, indices)
}

/// State of a slot's outstanding `map_async` request.
#[derive(Debug, PartialEq, Eq)]
enum MapPoll {
    /// No request outstanding.
    Idle,
    Waiting,
    Mapped,
    Failed(String),
}

/// Map request bookkeeping for one readback buffer.
#[derive(Default)]
struct PendingMap {
    rx: Option<mpsc::Receiver<Result<(), String>>>,
}

impl PendingMap {
    /// Start tracking a new request; the sender goes to the map callback.
    fn arm(&mut self) -> mpsc::Sender<Result<(), String>> {
        let (tx, rx) = mpsc::channel();
        self.rx = Some(rx);
        tx
    }

    /// Non-blocking check. A finished request is forgotten once reported.
    fn poll(&mut self) -> MapPoll {
        let Some(rx) = self.rx.as_ref() else {
            return MapPoll::Idle;
        };
        let state = match rx.try_recv() {
            Ok(Ok(())) => MapPoll::Mapped,
            Ok(Err(e)) => MapPoll::Failed(e),
            Err(mpsc::TryRecvError::Empty) => return MapPoll::Waiting,
            Err(mpsc::TryRecvError::Disconnected) => {
                MapPoll::Failed("map callback dropped".into())
            }
        };
        self.rx = None;
        state
    }

    /// Forget an unread request. True when the buffer must be unmapped.
    fn take_stale(&mut self) -> bool {
        self.rx.take().is_some()
    }
}

/// Readback buffer for one query slot and the map request pending on it.
struct ReadbackSlot {
    buffer: wgpu::Buffer,
    pending: PendingMap,
}

impl ReadbackSlot {
    /// Drop a result nobody read before the slot is written again.
    fn discard_stale(&mut self, slot: usize) {
        if self.pending.take_stale() {
            tracing::debug!(slot, "unread query result discarded on slot reuse");
            self.buffer.unmap();
        }
    }
}

/// Buffers the kernel writes and the draw reads.
struct CullBuffers {
    cull_uniforms: wgpu::Buffer,
    bounds: wgpu::Buffer,
    args_template: wgpu::Buffer,
    scratch_args: wgpu::Buffer,
    scratch_visible: wgpu::Buffer,
    publish_args: wgpu::Buffer,
    publish_visible: wgpu::Buffer,
    draw_uniforms: wgpu::Buffer,
    instances: wgpu::Buffer,
}

/// Culling device backed by wgpu, drawing into an offscreen target.
///
/// Every buffer is created once at the configured capacity. Telemetry uses
/// a pipeline-statistics query set with one entry per ring slot, resolved
/// into a shared buffer and copied into a per-slot readback buffer so each
/// slot can be mapped independently.
pub struct WgpuCullDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capacity: u32,
    buffers: CullBuffers,
    template_args: IndirectDrawArgs,
    cull_pipeline: wgpu::ComputePipeline,
    cull_bind_group: wgpu::BindGroup,
    draw_pipeline: wgpu::RenderPipeline,
    draw_bind_group: wgpu::BindGroup,
    cube_vertex_buffer: wgpu::Buffer,
    cube_index_buffer: wgpu::Buffer,
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback: Vec<ReadbackSlot>,
    color_target: wgpu::TextureView,
    depth_target: wgpu::TextureView,
}

impl WgpuCullDevice {
    pub fn new(
        context: HeadlessContext,
        config: &PipelineConfig,
        width: u32,
        height: u32,
    ) -> Result<Self, CullError> {
        config.validate()?;
        let HeadlessContext { device, queue, .. } = context;
        if !device.features().contains(wgpu::Features::PIPELINE_STATISTICS_QUERY) {
            return Err(CullError::init(
                "query_set",
                "device was created without PIPELINE_STATISTICS_QUERY",
            ));
        }

        let (cube_verts, cube_indices) = cube_mesh();
        if cube_indices.len() as u32 != config.index_count_per_instance {
            return Err(CullError::InvalidConfig(format!(
                "cube mesh has {} indices, config expects {}",
                cube_indices.len(),
                config.index_count_per_instance
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let capacity = config.instance_capacity;
        let ring = config.query_ring_capacity as u32;
        let template_args = IndirectDrawArgs::reset(config.index_count_per_instance);
        let buffers = Self::create_buffers(&device, capacity, template_args);

        // Culling kernel
        let cull_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("cull_bind_group_layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::COMPUTE),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(3, wgpu::ShaderStages::COMPUTE, false),
            ],
        });
        let cull_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cull_bind_group"),
            layout: &cull_layout,
            entries: &[
                entry(0, &buffers.cull_uniforms),
                entry(1, &buffers.bounds),
                entry(2, &buffers.scratch_args),
                entry(3, &buffers.scratch_visible),
            ],
        });
        let cull_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("cull_shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::CULL_SHADER.into()),
        });
        let cull_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cull_pipeline_layout"),
            bind_group_layouts: &[&cull_layout],
            push_constant_ranges: &[],
        });
        let cull_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("cull_pipeline"),
            layout: Some(&cull_pipeline_layout),
            module: &cull_shader,
            entry_point: Some("cs_cull"),
            compilation_options: Default::default(),
            cache: None,
        });

        // Indirect draw
        let draw_stages = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("draw_bind_group_layout"),
            entries: &[
                uniform_entry(0, draw_stages),
                storage_entry(1, wgpu::ShaderStages::VERTEX, true),
                storage_entry(2, wgpu::ShaderStages::VERTEX, true),
            ],
        });
        let draw_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("draw_bind_group"),
            layout: &draw_layout,
            entries: &[
                entry(0, &buffers.draw_uniforms),
                entry(1, &buffers.instances),
                entry(2, &buffers.publish_visible),
            ],
        });
        let draw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("draw_shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::DRAW_SHADER.into()),
        });
        let draw_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("draw_pipeline_layout"),
            bind_group_layouts: &[&draw_layout],
            push_constant_ranges: &[],
        });
        let draw_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("draw_pipeline"),
            layout: Some(&draw_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &draw_shader,
                entry_point: Some("vs_draw"),
                compilation_options: Default::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![
                        0 => Float32x3,
                        1 => Float32x3,
                    ],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &draw_shader,
                entry_point: Some("fs_draw"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: Default::default(),
            multiview: None,
            cache: None,
        });

        let cube_vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("cube_vertex_buffer"),
            contents: bytemuck::cast_slice(&cube_verts),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let cube_index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("cube_index_buffer"),
            contents: bytemuck::cast_slice(&cube_indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        // Telemetry. wgpu exposes no input-assembler primitive counter, so
        // clipper invocations stand in for primitives drawn.
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("telemetry_query_set"),
            ty: wgpu::QueryType::PipelineStatistics(
                wgpu::PipelineStatisticsTypes::CLIPPER_INVOCATIONS,
            ),
            count: ring,
        });
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("telemetry_resolve_buffer"),
            size: u64::from(ring) * wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = (0..ring)
            .map(|slot| ReadbackSlot {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(format!("telemetry_readback_{slot}").as_str()),
                    size: QUERY_RESULT_SIZE,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                pending: PendingMap::default(),
            })
            .collect();

        let (color_target, depth_target) = create_targets(&device, width, height);

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(CullError::init("culling resources", err));
        }

        tracing::debug!(capacity, ring, width, height, "wgpu culling device created");
        Ok(Self {
            device,
            queue,
            capacity,
            buffers,
            template_args,
            cull_pipeline,
            cull_bind_group,
            draw_pipeline,
            draw_bind_group,
            cube_vertex_buffer,
            cube_index_buffer,
            query_set,
            resolve_buffer,
            readback,
            color_target,
            depth_target,
        })
    }

    fn create_buffers(
        device: &wgpu::Device,
        capacity: u32,
        template_args: IndirectDrawArgs,
    ) -> CullBuffers {
        use wgpu::BufferUsages as U;

        let sized = |label: &str, size: u64, usage: U| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let capacity = u64::from(capacity);
        let visible_size = capacity * std::mem::size_of::<u32>() as u64;

        CullBuffers {
            cull_uniforms: sized(
                "cull_uniforms",
                std::mem::size_of::<CullUniforms>() as u64,
                U::UNIFORM | U::COPY_DST,
            ),
            bounds: sized(
                "culling_params",
                capacity * std::mem::size_of::<InstanceBounds>() as u64,
                U::STORAGE | U::COPY_DST,
            ),
            args_template: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("draw_args_template"),
                contents: bytemuck::bytes_of(&template_args),
                usage: U::COPY_SRC | U::COPY_DST,
            }),
            scratch_args: sized("scratch_draw_args", ARGS_SIZE, U::STORAGE | U::COPY_SRC | U::COPY_DST),
            scratch_visible: sized("scratch_visibility", visible_size, U::STORAGE | U::COPY_SRC),
            publish_args: sized("publish_draw_args", ARGS_SIZE, U::INDIRECT | U::COPY_SRC | U::COPY_DST),
            publish_visible: sized("publish_visibility", visible_size, U::STORAGE | U::COPY_SRC | U::COPY_DST),
            draw_uniforms: sized(
                "draw_uniforms",
                std::mem::size_of::<DrawUniforms>() as u64,
                U::UNIFORM | U::COPY_DST,
            ),
            instances: sized(
                "instance_data",
                capacity * std::mem::size_of::<InstanceData>() as u64,
                U::STORAGE | U::COPY_DST,
            ),
        }
    }

    /// Offscreen colour target the last frame was drawn into.
    pub fn color_target(&self) -> &wgpu::TextureView {
        &self.color_target
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        let (color, depth) = create_targets(&self.device, width, height);
        self.color_target = color;
        self.depth_target = depth;
    }

    fn check_slots(&self, stream: &CommandStream) -> Result<(), CullError> {
        for command in stream.commands() {
            if let DeviceCommand::BeginQuery { slot } | DeviceCommand::EndQuery { slot } = *command
            {
                if slot >= self.readback.len() {
                    return Err(CullError::Device(format!(
                        "query slot {slot} out of range ({} slots)",
                        self.readback.len()
                    )));
                }
            }
        }
        Ok(())
    }

    fn begin_draw_pass(&self, encoder: &mut wgpu::CommandEncoder) -> wgpu::RenderPass<'static> {
        let mut pass = encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("indirect_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.color_target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.1,
                            g: 0.1,
                            b: 0.15,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_target,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                ..Default::default()
            })
            .forget_lifetime();
        pass.set_pipeline(&self.draw_pipeline);
        pass.set_bind_group(0, &self.draw_bind_group, &[]);
        pass.set_vertex_buffer(0, self.cube_vertex_buffer.slice(..));
        pass.set_index_buffer(self.cube_index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass
    }

    fn write_staged(
        &self,
        buffer: &wgpu::Buffer,
        name: &'static str,
        bytes: &[u8],
    ) -> Result<(), CullError> {
        let Some(size) = wgpu::BufferSize::new(bytes.len() as u64) else {
            return Ok(());
        };
        let mut view = self
            .queue
            .write_buffer_with(buffer, 0, size)
            .ok_or(CullError::TransientMap { buffer: name })?;
        view.copy_from_slice(bytes);
        Ok(())
    }

    /// Blocking map of a freshly copied buffer. Debug paths only.
    fn map_blocking(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>, CullError> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {
                let bytes = slice.get_mapped_range().to_vec();
                buffer.unmap();
                Ok(bytes)
            }
            Ok(Err(e)) => Err(CullError::Device(format!("readback map failed: {e}"))),
            Err(_) => Err(CullError::Device("readback callback dropped".into())),
        }
    }
}

impl QuerySource for WgpuCullDevice {
    fn try_fetch_query(&mut self, slot: usize) -> Result<QueryFetch, CullError> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        let entry = self
            .readback
            .get_mut(slot)
            .ok_or_else(|| CullError::Device(format!("query slot {slot} out of range")))?;
        match entry.pending.poll() {
            MapPoll::Idle | MapPoll::Waiting => Ok(QueryFetch::NotReady),
            MapPoll::Mapped => {
                let primitives = {
                    let data = entry.buffer.slice(..).get_mapped_range();
                    bytemuck::pod_read_unaligned::<u64>(&data[..QUERY_RESULT_SIZE as usize])
                };
                entry.buffer.unmap();
                Ok(QueryFetch::Ready(PipelineStatistics { primitives }))
            }
            MapPoll::Failed(error) => {
                tracing::debug!(slot, %error, "query readback failed");
                Ok(QueryFetch::Lost)
            }
        }
    }
}

impl CullDevice for WgpuCullDevice {
    fn instance_capacity(&self) -> u32 {
        self.capacity
    }

    fn query_slots(&self) -> usize {
        self.readback.len()
    }

    fn upload(&mut self, frame: &FrameUpload<'_>) -> Result<(), CullError> {
        let count = frame.params.instance_count();
        if count > self.capacity {
            return Err(CullError::CapacityExceeded {
                requested: count as usize,
                capacity: self.capacity,
            });
        }
        if frame.transforms.len() != count as usize {
            return Err(CullError::Device(format!(
                "{} transforms for {count} culled instances",
                frame.transforms.len()
            )));
        }

        self.write_staged(
            &self.buffers.bounds,
            "culling_params",
            bytemuck::cast_slice(frame.params.bounds()),
        )?;

        let instances: Vec<InstanceData> = frame
            .transforms
            .iter()
            .enumerate()
            .map(|(i, model)| {
                let shading = frame.shading.get(i).copied().unwrap_or_default();
                InstanceData::new(model, shading)
            })
            .collect();
        self.write_staged(
            &self.buffers.instances,
            "instance_data",
            bytemuck::cast_slice(&instances),
        )?;

        let cull = CullUniforms {
            planes: frame.planes.to_gpu(),
            instance_count: count,
            _pad: [0; 3],
        };
        self.queue
            .write_buffer(&self.buffers.cull_uniforms, 0, bytemuck::bytes_of(&cull));

        if frame.lights.len() > MAX_LIGHTS {
            tracing::debug!(
                lights = frame.lights.len(),
                max = MAX_LIGHTS,
                "extra lights ignored"
            );
        }
        let mut lights = [GpuLight::zeroed(); MAX_LIGHTS];
        for (dst, light) in lights.iter_mut().zip(frame.lights) {
            *dst = GpuLight {
                position: light.position.extend(1.0).to_array(),
                color: light.color.extend(1.0).to_array(),
            };
        }
        let draw = DrawUniforms {
            view_proj: frame.view_projection.to_cols_array_2d(),
            camera_position: frame.camera_position.extend(1.0).to_array(),
            light_count: frame.lights.len().min(MAX_LIGHTS) as u32,
            _pad: [0; 3],
            lights,
        };
        self.queue
            .write_buffer(&self.buffers.draw_uniforms, 0, bytemuck::bytes_of(&draw));
        Ok(())
    }

    fn submit(&mut self, stream: CommandStream) -> Result<(), CullError> {
        stream.validate()?;
        self.check_slots(&stream)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cull_frame_encoder"),
            });
        let mut pass: Option<wgpu::RenderPass<'static>> = None;
        let mut ended = Vec::new();

        for command in stream.commands() {
            match *command {
                DeviceCommand::ResetDrawArgs(args) => {
                    if args != self.template_args {
                        self.queue.write_buffer(
                            &self.buffers.args_template,
                            0,
                            bytemuck::bytes_of(&args),
                        );
                        self.template_args = args;
                    }
                    encoder.copy_buffer_to_buffer(
                        &self.buffers.args_template,
                        0,
                        &self.buffers.scratch_args,
                        0,
                        ARGS_SIZE,
                    );
                }
                DeviceCommand::DispatchCull { workgroups } => {
                    let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("cull_pass"),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&self.cull_pipeline);
                    cpass.set_bind_group(0, &self.cull_bind_group, &[]);
                    if workgroups > 0 {
                        cpass.dispatch_workgroups(workgroups, 1, 1);
                    }
                }
                DeviceCommand::PublishDrawArgs => encoder.copy_buffer_to_buffer(
                    &self.buffers.scratch_args,
                    0,
                    &self.buffers.publish_args,
                    0,
                    ARGS_SIZE,
                ),
                DeviceCommand::PublishVisibility => encoder.copy_buffer_to_buffer(
                    &self.buffers.scratch_visible,
                    0,
                    &self.buffers.publish_visible,
                    0,
                    self.buffers.publish_visible.size(),
                ),
                DeviceCommand::BeginQuery { slot } => {
                    let mut p = self.begin_draw_pass(&mut encoder);
                    p.begin_pipeline_statistics_query(&self.query_set, slot as u32);
                    pass = Some(p);
                }
                DeviceCommand::DrawIndexedIndirect => match pass.as_mut() {
                    Some(p) => p.draw_indexed_indirect(&self.buffers.publish_args, 0),
                    None => {
                        let mut p = self.begin_draw_pass(&mut encoder);
                        p.draw_indexed_indirect(&self.buffers.publish_args, 0);
                    }
                },
                DeviceCommand::EndQuery { slot } => {
                    if let Some(mut p) = pass.take() {
                        p.end_pipeline_statistics_query();
                    }
                    let offset = slot as u64 * wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT;
                    let index = slot as u32;
                    encoder.resolve_query_set(
                        &self.query_set,
                        index..index + 1,
                        &self.resolve_buffer,
                        offset,
                    );
                    self.readback[slot].discard_stale(slot);
                    encoder.copy_buffer_to_buffer(
                        &self.resolve_buffer,
                        offset,
                        &self.readback[slot].buffer,
                        0,
                        QUERY_RESULT_SIZE,
                    );
                    ended.push(slot);
                }
            }
        }
        drop(pass);

        self.queue.submit(Some(encoder.finish()));

        for slot in ended {
            let entry = &mut self.readback[slot];
            let tx = entry.pending.arm();
            entry.buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result.map_err(|e| e.to_string()));
            });
        }
        tracing::trace!(frame = stream.frame(), "wgpu frame submitted");
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), CullError> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_published(&mut self) -> Result<PublishedFrame, CullError> {
        let visible_size = self.buffers.publish_visible.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("published_readback"),
            size: ARGS_SIZE.next_multiple_of(8) + visible_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("published_readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffers.publish_args, 0, &staging, 0, ARGS_SIZE);
        encoder.copy_buffer_to_buffer(
            &self.buffers.publish_visible,
            0,
            &staging,
            ARGS_SIZE.next_multiple_of(8),
            visible_size,
        );
        self.queue.submit(Some(encoder.finish()));

        let bytes = self.map_blocking(&staging)?;
        let args: IndirectDrawArgs = bytemuck::pod_read_unaligned(&bytes[..ARGS_SIZE as usize]);
        let start = ARGS_SIZE.next_multiple_of(8) as usize;
        let n = (args.instance_count.min(self.capacity)) as usize;
        let visible = bytes[start..start + n * 4]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<u32>)
            .collect();
        Ok(PublishedFrame { args, visible })
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    read_only: bool,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn create_targets(
    device: &wgpu::Device,
    width: u32,
    height: u32,
) -> (wgpu::TextureView, wgpu::TextureView) {
    let size = wgpu::Extent3d {
        width: width.max(1),
        height: height.max(1),
        depth_or_array_layers: 1,
    };
    let target = |label, format| {
        device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            })
            .create_view(&Default::default())
    };
    (
        target("color_target", COLOR_FORMAT),
        target("depth_target", wgpu::TextureFormat::Depth32Float),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucull_core::{CullingPipeline, FrameInputs};

    #[test]
    fn cube_mesh_matches_default_config() {
        let (verts, indices) = cube_mesh();
        let config = PipelineConfig::default();
        assert_eq!(verts.len(), 24);
        assert_eq!(indices.len() as u32, config.index_count_per_instance);
        assert_eq!(indices.len() as u32 / 3, config.primitives_per_instance);
        assert!(indices.iter().all(|&i| (i as usize) < verts.len()));
    }

    #[test]
    fn cube_faces_wind_outward() {
        let (verts, indices) = cube_mesh();
        for tri in indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| glam::Vec3::from(verts[i as usize].position));
            let face_normal = (b - a).cross(c - a).normalize();
            let n = glam::Vec3::from(verts[tri[0] as usize].normal);
            assert!(face_normal.dot(n) > 0.99);
        }
    }

    #[test]
    fn pending_map_reports_each_result_once() {
        let mut pending = PendingMap::default();
        assert_eq!(pending.poll(), MapPoll::Idle);

        let tx = pending.arm();
        assert_eq!(pending.poll(), MapPoll::Waiting);
        tx.send(Ok(())).unwrap();
        assert_eq!(pending.poll(), MapPoll::Mapped);
        assert_eq!(pending.poll(), MapPoll::Idle);

        let tx = pending.arm();
        tx.send(Err("buffer destroyed".into())).unwrap();
        assert_eq!(pending.poll(), MapPoll::Failed("buffer destroyed".into()));

        drop(pending.arm());
        assert!(matches!(pending.poll(), MapPoll::Failed(_)));
    }

    #[test]
    fn slot_reuse_drops_unread_request() {
        let mut pending = PendingMap::default();
        assert!(!pending.take_stale());

        let tx = pending.arm();
        assert!(pending.take_stale());
        assert_eq!(pending.poll(), MapPoll::Idle);

        // A late callback from the dropped request is not picked up by the next one.
        let _ = tx.send(Ok(()));
        let _next = pending.arm();
        assert_eq!(pending.poll(), MapPoll::Waiting);
    }

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<CullUniforms>(), 112);
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 96 + 32 * MAX_LIGHTS);
        assert_eq!(std::mem::size_of::<InstanceData>(), 96);
    }

    #[test]
    #[ignore = "needs a GPU adapter with pipeline-statistics queries"]
    fn headless_pipeline_reports_all_instances() {
        let context = HeadlessContext::new().unwrap();
        let config = PipelineConfig {
            query_ring_capacity: 4,
            ..PipelineConfig::with_capacity(64)
        };
        let device = WgpuCullDevice::new(context, &config, 64, 64).unwrap();
        let mut pipeline = CullingPipeline::new(config, device).unwrap();

        let eye = glam::Vec3::new(0.0, 0.0, 10.0);
        let transforms = vec![Mat4::IDENTITY; 64];
        let inputs = FrameInputs {
            view: Mat4::look_at_rh(eye, glam::Vec3::ZERO, glam::Vec3::Y),
            projection: Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 1000.0),
            camera_position: eye,
            freeze_frustum: false,
            transforms: &transforms,
            shading: &[],
            lights: &[],
        };
        for _ in 0..3 {
            pipeline.render_frame(&inputs).unwrap();
        }
        assert_eq!(pipeline.drain_telemetry().unwrap(), Some(64));
        assert_eq!(pipeline.read_published().unwrap().args.instance_count, 64);
    }
}
