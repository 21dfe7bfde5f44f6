/// WGSL compute kernel: tests each instance AABB against the frustum and
/// appends visible indices to the scratch list.
pub const CULL_SHADER: &str = r#"
struct CullUniforms {
    planes: array<vec4<f32>, 6>,
    instance_count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
};

struct InstanceBounds {
    min: vec4<f32>,
    max: vec4<f32>,
};

struct DrawArgs {
    index_count: u32,
    instance_count: atomic<u32>,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
};

@group(0) @binding(0)
var<uniform> cull: CullUniforms;

@group(0) @binding(1)
var<storage, read> bounds: array<InstanceBounds>;

@group(0) @binding(2)
var<storage, read_write> args: DrawArgs;

@group(0) @binding(3)
var<storage, read_write> visible: array<u32>;

@compute @workgroup_size(64)
fn cs_cull(@builtin(global_invocation_id) id: vec3<u32>) {
    let idx = id.x;
    if (idx >= cull.instance_count) {
        return;
    }

    let b = bounds[idx];
    for (var i = 0u; i < 6u; i = i + 1u) {
        let p = cull.planes[i];
        // Positive vertex: the corner furthest along the plane normal.
        let v = select(b.min.xyz, b.max.xyz, p.xyz >= vec3<f32>(0.0));
        if (dot(p.xyz, v) + p.w < 0.0) {
            return;
        }
    }

    let slot = atomicAdd(&args.instance_count, 1u);
    visible[slot] = idx;
}
"#;

/// WGSL draw shader: instanced cubes indexed through the published
/// visibility list, lit by up to four point lights.
pub const DRAW_SHADER: &str = r#"
struct Light {
    position: vec4<f32>,
    color: vec4<f32>,
};

struct DrawUniforms {
    view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
    lights: array<Light, 4>,
};

struct InstanceData {
    model: mat4x4<f32>,
    base_color: vec4<f32>,
    params: vec4<f32>,
};

@group(0) @binding(0)
var<uniform> uniforms: DrawUniforms;

@group(0) @binding(1)
var<storage, read> instances: array<InstanceData>;

@group(0) @binding(2)
var<storage, read> visible: array<u32>;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
};

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) color: vec4<f32>,
    @location(3) shininess: f32,
};

@vertex
fn vs_draw(vertex: VertexInput, @builtin(instance_index) slot: u32) -> VertexOutput {
    let instance = instances[visible[slot]];
    let world_pos = instance.model * vec4<f32>(vertex.position, 1.0);
    let world_normal = (instance.model * vec4<f32>(vertex.normal, 0.0)).xyz;

    var out: VertexOutput;
    out.clip_position = uniforms.view_proj * world_pos;
    out.world_position = world_pos.xyz;
    out.world_normal = normalize(world_normal);
    out.color = instance.base_color;
    out.shininess = instance.params.x;
    return out;
}

@fragment
fn fs_draw(in: VertexOutput) -> @location(0) vec4<f32> {
    let n = normalize(in.world_normal);
    let to_eye = normalize(uniforms.camera_position.xyz - in.world_position);
    var lighting = vec3<f32>(0.15);

    for (var i = 0u; i < uniforms.light_count; i = i + 1u) {
        let light = uniforms.lights[i];
        let to_light = light.position.xyz - in.world_position;
        let dist = length(to_light);
        let l = to_light / max(dist, 1e-4);
        let attenuation = 1.0 / (1.0 + 0.05 * dist * dist);
        let diffuse = max(dot(n, l), 0.0);
        let h = normalize(l + to_eye);
        let specular = pow(max(dot(n, h), 0.0), max(in.shininess, 1.0));
        lighting = lighting + light.color.rgb * attenuation * (diffuse + 0.5 * specular);
    }

    return vec4<f32>(in.color.rgb * lighting, in.color.a);
}
"#;
