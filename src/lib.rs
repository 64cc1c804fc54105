/// UI and rendering thread wiring for the out-of-core surfel viewer. The
/// event loop thread forwards input to the render thread over a channel; the
/// render thread drives front tracking, the cloud loader and the splat
/// renderer, frame by frame, while the hierarchy is still being built in the
/// background.
///
/// The two-thread event-loop/render split is based on code shared by
/// A.B. Sørensen in
/// https://github.com/absorensen/the-guide/tree/main/m2_concurrency/code/egui-winit-wgpu-template
/// Apache License 2.0

pub mod camera;
pub mod command;
pub mod config;
pub mod data_structures;
pub mod disk;
mod error;
pub mod gpu_handles;
pub mod octree;
pub mod renderer;
pub mod tools;

pub use error::{Error, Result};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use winit::{
    dpi::PhysicalSize,
    event::*,
    event_loop::{ControlFlow, EventLoop},
};

use camera::{Camera, CameraController};
use command::Command;
use config::{OctreeDescriptor, RuntimeConfig};
use gpu_handles::GpuHandles;
use octree::Octree;
use renderer::SplatRenderer;
use tools::OctreeStats;

const WINDOW_SIZE: winit::dpi::PhysicalSize<u32> = winit::dpi::PhysicalSize::new(1280, 800);
const CAMERA_SPEED: f32 = 0.01;

/// Default squared window-space diagonal below which a node stands for its
/// subtree.
const DEFAULT_PROJ_THRESHOLD: f32 = 900.0;

pub fn run(input: PathBuf, config: RuntimeConfig) {
    env_logger::init();

    if !gpu_handles::self_test() {
        panic!("Unable to find a GPU adapter");
    }

    let event_loop = EventLoop::new();
    let window = winit::window::WindowBuilder::new()
        .with_decorations(true)
        .with_resizable(true)
        .with_title("splatview")
        .with_inner_size(WINDOW_SIZE)
        .build(&event_loop)
        .unwrap();

    let instance = gpu_handles::get_instance();
    // Safety: the surface must not outlive the window. The event loop below
    // never returns, so the window lives for the rest of the process.
    let surface = unsafe { instance.create_surface(&window) }.expect("failed to create surface");
    let gpu = Arc::new(GpuHandles::with_instance(instance, Some(&surface)));

    let surface_caps = surface.get_capabilities(&gpu.adapter);
    let surface_format = surface_caps
        .formats
        .iter()
        .copied()
        .find(|f| f.is_srgb())
        .unwrap_or(surface_caps.formats[0]);
    let surface_config = wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format: surface_format,
        width: WINDOW_SIZE.width,
        height: WINDOW_SIZE.height,
        present_mode: wgpu::PresentMode::Immediate,
        alpha_mode: surface_caps.alpha_modes[0],
        view_formats: vec![],
    };
    surface.configure(&gpu.device, &surface_config);

    let renderer = SplatRenderer::new(
        Arc::clone(&gpu),
        surface_format,
        (surface_config.width, surface_config.height),
        Path::new("res/shaders"),
    )
    .expect("failed to set up the splat renderer");

    let octree =
        open_octree(&input, Arc::clone(&gpu), config).expect("failed to open the point cloud");

    let (transmitter, receiver): (Sender<Command>, Receiver<Command>) = unbounded::<Command>();

    let _render_thread = thread::Builder::new()
        .name("render thread".into())
        .spawn(move || rendering_thread(surface, surface_config, gpu, renderer, octree, receiver));

    main_thread(event_loop, transmitter);
}

/// A raw point file constructs from scratch; a descriptor document may point
/// at a sorted file or a prebuilt hierarchy.
pub fn open_octree(input: &Path, gpu: Arc<GpuHandles>, config: RuntimeConfig) -> Result<Octree> {
    if input.extension().is_some_and(|ext| ext == "oct") {
        let descriptor = OctreeDescriptor::load(input)?;
        Octree::from_descriptor(&descriptor, Some(gpu), config)
    } else {
        Octree::from_point_file(input, Some(gpu), config)
    }
}

fn main_thread(event_loop: EventLoop<()>, transmitter: Sender<Command>) {
    event_loop.run(move |event, _, control_flow| {
        let transmitter: &Sender<Command> = &transmitter;

        if let Event::WindowEvent { event, .. } = event {
            match event {
                WindowEvent::Resized(size) => {
                    transmitter.send(Command::Resize { new_size: size }).unwrap();
                }

                WindowEvent::CloseRequested => {
                    transmitter.send(Command::Shutdown { value: true }).unwrap();
                    *control_flow = ControlFlow::Exit;
                }

                WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            state,
                            virtual_keycode: Some(key),
                            ..
                        },
                    ..
                } => match key {
                    VirtualKeyCode::Escape => {
                        transmitter.send(Command::Shutdown { value: true }).unwrap();
                        *control_flow = ControlFlow::Exit;
                    }
                    key => transmitter.send(Command::KeyEvent { key, state }).unwrap(),
                },
                _ => (),
            }
        }
    });
}

fn rendering_thread(
    surface: wgpu::Surface,
    mut surface_config: wgpu::SurfaceConfiguration,
    gpu: Arc<GpuHandles>,
    mut renderer: SplatRenderer,
    mut octree: Octree,
    receiver: Receiver<Command>,
) {
    let mut camera = Camera::default();
    let mut camera_controller = CameraController::new(CAMERA_SPEED);
    let mut proj_threshold = DEFAULT_PROJ_THRESHOLD;
    let mut should_render = true;
    let mut creation_reported = false;

    let mut statistics = OctreeStats::new();
    let mut last_report = std::time::Instant::now();

    loop {
        // Drain pending commands before the next frame.
        loop {
            match receiver.recv_timeout(std::time::Duration::from_millis(1)) {
                Err(RecvTimeoutError::Timeout) => break,
                Err(_) => return,
                Ok(command) => {
                    camera_controller.handle_camera_commands(&command);
                    match command {
                        Command::Resize { new_size } => {
                            resize(&surface, &mut surface_config, &gpu, &mut renderer, new_size);
                        }
                        Command::Render { value } => should_render = value,
                        Command::SetProjThreshold { value } => proj_threshold = value,
                        Command::KeyEvent {
                            key,
                            state: ElementState::Pressed,
                        } => match key {
                            // Coarser and finer level of detail.
                            VirtualKeyCode::Plus | VirtualKeyCode::NumpadAdd => {
                                proj_threshold *= 1.5;
                            }
                            VirtualKeyCode::Minus | VirtualKeyCode::NumpadSubtract => {
                                proj_threshold /= 1.5;
                            }
                            _ => {}
                        },
                        Command::KeyEvent { .. } => {}
                        Command::Shutdown { value } => {
                            if value {
                                return;
                            }
                        }
                    }
                }
            }
        }

        if !creation_reported && octree.is_creation_finished() {
            creation_reported = true;
            if let Some(stats) = octree.build_stats() {
                eprintln!(
                    "Hierarchy creation finished in {} ms ({} points).",
                    stats.duration_ms, stats.point_count
                );
            }
        }

        if !should_render {
            thread::yield_now();
            continue;
        }

        camera.aspect = surface_config.width as f32 / surface_config.height.max(1) as f32;
        camera_controller.update_camera(&mut camera);
        renderer.update_camera(&camera);

        let output = match surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost) => {
                surface.configure(&gpu.device, &surface_config);
                continue;
            }
            Err(wgpu::SurfaceError::OutOfMemory) => panic!("out of gpu memory"),
            Err(_) => continue,
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        renderer.set_target(view);

        let frame = octree.track_front(&mut renderer, proj_threshold);
        output.present();

        statistics.add_frame(&frame);
        if last_report.elapsed() > std::time::Duration::from_secs(5) {
            eprintln!("{statistics}");
            statistics.reset();
            last_report = std::time::Instant::now();
        }
    }
}

fn resize(
    surface: &wgpu::Surface,
    surface_config: &mut wgpu::SurfaceConfiguration,
    gpu: &Arc<GpuHandles>,
    renderer: &mut SplatRenderer,
    new_size: PhysicalSize<u32>,
) {
    if new_size.width > 0 && new_size.height > 0 {
        surface_config.width = new_size.width;
        surface_config.height = new_size.height;
        surface.configure(&gpu.device, surface_config);
        renderer.resize((new_size.width, new_size.height));
    }
}
