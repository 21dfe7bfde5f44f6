use gpucull_core::CullError;

/// Features the culling device cannot run without.
pub const REQUIRED_FEATURES: wgpu::Features = wgpu::Features::PIPELINE_STATISTICS_QUERY;

/// A wgpu device and queue with no window or surface attached.
pub struct HeadlessContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
}

impl HeadlessContext {
    /// Request an adapter and device that support pipeline-statistics
    /// queries. Blocks on the adapter and device requests.
    pub fn new() -> Result<Self, CullError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| CullError::init("adapter", "no compatible adapter found"))?;

        let adapter_info = adapter.get_info();
        let missing = REQUIRED_FEATURES - adapter.features();
        if !missing.is_empty() {
            return Err(CullError::init(
                "device",
                format!("adapter {} lacks {missing:?}", adapter_info.name),
            ));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpucull_device"),
                required_features: REQUIRED_FEATURES,
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| CullError::init("device", e))?;

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "headless GPU context ready"
        );
        Ok(Self {
            device,
            queue,
            adapter_info,
        })
    }
}
