use wgpu::{Adapter, AdapterInfo, Device, Instance, Queue};

// A convenience wrapper for interfacing with the GPU. Shared between the
// render thread and the cloud loader thread through an Arc; wgpu devices are
// internally synchronized.
pub struct GpuHandles {
    pub queue: Queue,
    pub adapter: Adapter,
    pub instance: Instance,
    pub device: Device,
}

impl GpuHandles {
    pub fn new() -> Self {
        Self::with_instance(get_instance(), None)
    }

    pub fn with_instance(instance: Instance, compatible_surface: Option<&wgpu::Surface>) -> Self {
        // You might want to change this to prefer a certain backend or a high power GPU.
        let adapter: Adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                force_fallback_adapter: false,
                compatible_surface,
            }))
            .expect("Failed to find an appropriate adapter");

        // Create the logical device and command queue.
        let (device, queue): (Device, Queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                features: wgpu::Features::empty(),
                limits: wgpu::Limits::default(),
                label: None,
            },
            None,
        ))
        .expect("Failed to create device");

        // Validation errors are fatal in debug builds and logged in release.
        device.on_uncaptured_error(Box::new(|error| {
            if cfg!(debug_assertions) {
                panic!("wgpu error: {error}");
            } else {
                log::error!("wgpu error: {error}");
            }
        }));

        GpuHandles {
            queue,
            adapter,
            instance,
            device,
        }
    }
}

impl Default for GpuHandles {
    fn default() -> Self {
        Self::new()
    }
}

pub fn get_instance() -> wgpu::Instance {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        dx12_shader_compiler: Default::default(),
    });
    instance
}

// Checks whether the system has a findable adapter (GPU).
// Returns false if no adapter is found.
pub fn self_test() -> bool {
    eprintln!("Performing self test to check system for compatibility.");
    let instance: Instance = get_instance();

    let adapter_option: Option<Adapter> =
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()));

    match adapter_option {
        Some(adapter) => {
            let info: AdapterInfo = adapter.get_info();
            println!("Found GPU: {:?}", info);
            true
        }
        None => {
            println!("Failed to find a usable GPU.");
            false
        }
    }
}
