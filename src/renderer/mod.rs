//! Surfel splat rendering. The front only depends on the small `CutRenderer`
//! contract; the wgpu implementation below draws the queued clouds with a
//! two-pass pipeline per frame, a depth-only visibility pass followed by an
//! attribute pass with additive blending.

pub mod cloud;
pub mod loader;

use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use cgmath::{Matrix4, SquareMatrix, Vector4};

use crate::camera::Camera;
use crate::data_structures::bbox::Bbox;
use crate::data_structures::surfel::SURFEL_SIZE;
use crate::data_structures::vector::{vec3f, Vec3f32};
use crate::error::{Error, Result};
use crate::gpu_handles::GpuHandles;
use crate::octree::node::Node;

/// What the front needs from a renderer: frame bracketing, node submission,
/// and the two view-dependent predicates driving prune and branch decisions.
pub trait CutRenderer {
    fn begin_frame(&mut self);

    /// Flushes the frame and reports how many points were consumed.
    fn end_frame(&mut self) -> u64;

    /// Queues a node's cloud for this frame.
    fn render(&mut self, node: &Node);

    /// Frustum test: true when the box is entirely outside the view.
    fn is_cullable(&self, bbox: &Bbox) -> bool;

    /// True when drawing the box's node alone suffices, i.e. the maximum
    /// squared window-space diagonal stays below the threshold.
    fn is_renderable(&self, bbox: &Bbox, proj_thresh: f32) -> bool;
}

/// View frustum as six inward-facing half spaces extracted from a
/// view-projection matrix.
#[derive(Copy, Clone, Debug)]
pub struct Frustum {
    planes: [Vector4<f32>; 6],
}

impl Frustum {
    pub fn from_view_proj(m: &Matrix4<f32>) -> Self {
        let row = |i: usize| Vector4::new(m.x[i], m.y[i], m.z[i], m.w[i]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        Self {
            planes: [
                r3 + r0, // left
                r3 - r0, // right
                r3 + r1, // bottom
                r3 - r1, // top
                r3 + r2, // near
                r3 - r2, // far
            ],
        }
    }

    /// True when every corner of the box lies outside one of the planes.
    pub fn is_cullable(&self, bbox: &Bbox) -> bool {
        let corners = bbox.corners();
        for plane in &self.planes {
            let all_outside = corners.iter().all(|c| {
                plane.x * c.0 + plane.y * c.1 + plane.z * c.2 + plane.w < 0.0
            });
            if all_outside {
                return true;
            }
        }
        false
    }
}

/// Projects a world position to window coordinates.
fn proj_to_window(
    point: Vec3f32,
    view_proj: &Matrix4<f32>,
    viewport: (u32, u32),
) -> (f32, f32) {
    let clip = view_proj * Vector4::new(point.0, point.1, point.2, 1.0);
    (
        (clip.x / clip.w + 1.0) * 0.5 * viewport.0 as f32,
        (clip.y / clip.w + 1.0) * 0.5 * viewport.1 as f32,
    )
}

/// The maximum squared window-space length of the box's two main diagonals.
pub fn projected_box_size(
    bbox: &Bbox,
    view_proj: &Matrix4<f32>,
    viewport: (u32, u32),
) -> f32 {
    let (min, max) = (bbox.min, bbox.max);

    let a0 = proj_to_window(min, view_proj, viewport);
    let a1 = proj_to_window(max, view_proj, viewport);
    let d0 = (a1.0 - a0.0, a1.1 - a0.1);

    let b0 = proj_to_window(vec3f(max.0, max.1, min.2), view_proj, viewport);
    let b1 = proj_to_window(vec3f(min.0, min.1, max.2), view_proj, viewport);
    let d1 = (b1.0 - b0.0, b1.1 - b0.1);

    f32::max(d0.0 * d0.0 + d0.1 * d0.1, d1.0 * d1.0 + d1.1 * d1.1)
}

#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniform {
    view_proj: [[f32; 4]; 4],
}

/// A queued node for the current frame.
#[derive(Copy, Clone)]
struct QueuedNode(NonNull<Node>);

// Safety: the render list lives on the tracking thread and is cleared every
// frame; the pointees are finalized nodes owned by the octree.
unsafe impl Send for QueuedNode {}

pub struct SplatRenderer {
    gpu: Arc<GpuHandles>,
    depth_pipeline: wgpu::RenderPipeline,
    attrib_pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    depth_view: wgpu::TextureView,
    view_proj: Matrix4<f32>,
    frustum: Frustum,
    viewport: (u32, u32),
    target: Option<wgpu::TextureView>,
    frame_queue: Vec<QueuedNode>,
}

impl SplatRenderer {
    pub fn new(
        gpu: Arc<GpuHandles>,
        surface_format: wgpu::TextureFormat,
        size: (u32, u32),
        shader_dir: &Path,
    ) -> Result<Self> {
        let device = &gpu.device;

        let shader_path = shader_dir.join("splat.wgsl");
        let shader_source = std::fs::read_to_string(&shader_path)
            .map_err(|e| Error::Input(format!("cannot read shader {shader_path:?}: {e}")))?;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("splat shader"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame uniform"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("splat bind group layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("splat bind group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("splat pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: SURFEL_SIZE as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 12,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 24,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x3,
                },
            ],
        };

        // Visibility pass: depth only, no color target.
        let depth_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("splat depth pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[vertex_layout.clone()],
            },
            fragment: None,
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::PointList,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        // Attribute pass: additive accumulation against the visibility
        // depth.
        let attrib_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("splat attribute pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[vertex_layout],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState {
                        color: wgpu::BlendComponent {
                            src_factor: wgpu::BlendFactor::One,
                            dst_factor: wgpu::BlendFactor::One,
                            operation: wgpu::BlendOperation::Add,
                        },
                        alpha: wgpu::BlendComponent::OVER,
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::PointList,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: false,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let depth_view = create_depth_texture(device, size);
        let view_proj = Matrix4::identity();

        Ok(Self {
            gpu,
            depth_pipeline,
            attrib_pipeline,
            uniform_buffer,
            bind_group,
            depth_view,
            frustum: Frustum::from_view_proj(&view_proj),
            view_proj,
            viewport: size,
            target: None,
            frame_queue: Vec::new(),
        })
    }

    pub fn resize(&mut self, size: (u32, u32)) {
        if size.0 > 0 && size.1 > 0 {
            self.viewport = size;
            self.depth_view = create_depth_texture(&self.gpu.device, size);
        }
    }

    /// Caches the camera's view-projection for this frame's predicates and
    /// draw calls.
    pub fn update_camera(&mut self, camera: &Camera) {
        self.view_proj = camera.build_view_projection_matrix();
        self.frustum = Frustum::from_view_proj(&self.view_proj);
        let uniform = FrameUniform {
            view_proj: self.view_proj.into(),
        };
        self.gpu
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));
    }

    /// Sets the frame's color target. Must be called before `end_frame`
    /// records the draw.
    pub fn set_target(&mut self, target: wgpu::TextureView) {
        self.target = Some(target);
    }
}

fn create_depth_texture(device: &wgpu::Device, size: (u32, u32)) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("splat depth"),
        size: wgpu::Extent3d {
            width: size.0.max(1),
            height: size.1.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

impl CutRenderer for SplatRenderer {
    fn begin_frame(&mut self) {
        self.frame_queue.clear();
    }

    fn end_frame(&mut self) -> u64 {
        let Some(target) = self.target.take() else {
            return 0;
        };

        // Hold every queued cloud locked while the passes are recorded so
        // the loader cannot drop a buffer mid-frame.
        let nodes: Vec<&Node> = self
            .frame_queue
            .iter()
            // Safety: queued by `render` this frame, see QueuedNode.
            .map(|q| unsafe { q.0.as_ref() })
            .collect();
        let guards: Vec<_> = nodes.iter().map(|node| node.cloud_slot()).collect();

        let mut rendered_points = 0u64;
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("splat encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("visibility pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: true,
                    }),
                    stencil_ops: None,
                }),
            });
            pass.set_pipeline(&self.depth_pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            for guard in &guards {
                if let Some(buffer) = guard.as_ref().and_then(|cloud| cloud.buffer()) {
                    let points = guard.as_ref().map(|c| c.num_points()).unwrap_or(0);
                    pass.set_vertex_buffer(0, buffer.slice(..));
                    pass.draw(0..points, 0..1);
                }
            }
        }

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("attribute pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.0,
                            g: 0.0,
                            b: 0.0,
                            a: 1.0,
                        }),
                        store: true,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: false,
                    }),
                    stencil_ops: None,
                }),
            });
            pass.set_pipeline(&self.attrib_pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            for guard in &guards {
                if let Some(buffer) = guard.as_ref().and_then(|cloud| cloud.buffer()) {
                    let points = guard.as_ref().map(|c| c.num_points()).unwrap_or(0);
                    pass.set_vertex_buffer(0, buffer.slice(..));
                    pass.draw(0..points, 0..1);
                    rendered_points += points as u64;
                }
            }
        }

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.frame_queue.clear();
        rendered_points
    }

    fn render(&mut self, node: &Node) {
        self.frame_queue.push(QueuedNode(NonNull::from(node)));
    }

    fn is_cullable(&self, bbox: &Bbox) -> bool {
        self.frustum.is_cullable(bbox)
    }

    fn is_renderable(&self, bbox: &Bbox, proj_thresh: f32) -> bool {
        projected_box_size(bbox, &self.view_proj, self.viewport) < proj_thresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::vector::vec3f;
    use cgmath::{perspective, Deg, Point3, Vector3};

    fn look_down_negative_z() -> Matrix4<f32> {
        let view = Matrix4::look_at_rh(
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(0.0, 0.0, 0.0),
            Vector3::unit_y(),
        );
        let proj = perspective(Deg(60.0), 1.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn frustum_keeps_centered_box() {
        let frustum = Frustum::from_view_proj(&look_down_negative_z());
        let bbox = Bbox::from_min_max(vec3f(-0.5, -0.5, -0.5), vec3f(0.5, 0.5, 0.5));
        assert!(!frustum.is_cullable(&bbox));
    }

    #[test]
    fn frustum_culls_box_behind_camera() {
        let frustum = Frustum::from_view_proj(&look_down_negative_z());
        let bbox = Bbox::from_min_max(vec3f(-0.5, -0.5, 8.0), vec3f(0.5, 0.5, 9.0));
        assert!(frustum.is_cullable(&bbox));
    }

    #[test]
    fn frustum_culls_box_far_off_axis() {
        let frustum = Frustum::from_view_proj(&look_down_negative_z());
        let bbox = Bbox::from_min_max(vec3f(50.0, 50.0, -0.5), vec3f(51.0, 51.0, 0.5));
        assert!(frustum.is_cullable(&bbox));
    }

    #[test]
    fn projected_size_shrinks_with_distance() {
        let view_proj = look_down_negative_z();
        let viewport = (800, 600);
        let near = Bbox::from_min_max(vec3f(-0.5, -0.5, -0.5), vec3f(0.5, 0.5, 0.5));
        let far = Bbox::from_min_max(vec3f(-0.5, -0.5, -80.0), vec3f(0.5, 0.5, -79.0));
        let near_size = projected_box_size(&near, &view_proj, viewport);
        let far_size = projected_box_size(&far, &view_proj, viewport);
        assert!(near_size > far_size);
        assert!(far_size > 0.0);
    }

    #[test]
    fn renderable_is_a_threshold_on_projected_size() {
        let view_proj = look_down_negative_z();
        let viewport = (800, 600);
        let bbox = Bbox::from_min_max(vec3f(-0.5, -0.5, -0.5), vec3f(0.5, 0.5, 0.5));
        let size = projected_box_size(&bbox, &view_proj, viewport);
        assert!(size > 0.0);
        // A threshold just above the measured size admits the box, one just
        // below forces a descent.
        assert!(size < size + 1.0);
        assert!(!(size < size - 1.0));
    }
}
