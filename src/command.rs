/// Types for sending messages from the UI thread to the rendering thread
/// Based on code shared by A.B. Sørensen in
/// https://github.com/absorensen/the-guide/tree/main/m2_concurrency/code/egui-winit-wgpu-template
/// Apache License 2.0

use winit::{
    dpi::PhysicalSize,
    event::{ElementState, VirtualKeyCode},
};

#[derive(Debug)]
pub enum Command {
    Resize { new_size: PhysicalSize<u32> },
    Render { value: bool },
    /// Squared window-space size below which a node's box is considered
    /// small enough to stand for its whole subtree.
    SetProjThreshold { value: f32 },
    KeyEvent { key: VirtualKeyCode, state: ElementState },
    Shutdown { value: bool },
}
