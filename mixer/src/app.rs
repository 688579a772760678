//! Window and render loop of the daemon.
//!
//! The winit event loop owns the operator. IPC requests arrive as user
//! events, so every state change happens on this thread between frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use common::{Command, MixerError, Response};
use parking_lot::Mutex;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoopProxy};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use crate::config::Config;
use crate::controller::LogReporter;
use crate::gpu::{GpuContext, ImportCapabilities, PlaneRenderer, WgpuBackend};
use crate::ipc_server::{self, CommandSink, Request, SharedStatus};
use crate::media::GstSourceFactory;
use crate::operator::{OperatorSettings, PlaybackOperator};

/// Events injected into the winit loop from other threads
#[derive(Debug)]
pub enum AppEvent {
    Ipc(Request),
    Shutdown,
}

/// Forwards IPC requests into the event loop
pub struct ProxySink(Mutex<EventLoopProxy<AppEvent>>);

impl ProxySink {
    pub fn new(proxy: EventLoopProxy<AppEvent>) -> Self {
        Self(Mutex::new(proxy))
    }
}

impl CommandSink for ProxySink {
    fn dispatch(&self, request: Request) -> Result<(), MixerError> {
        self.0
            .lock()
            .send_event(AppEvent::Ipc(request))
            .map_err(|_| MixerError::ShuttingDown)
    }
}

/// Everything that exists once the window is up
struct Running {
    window: Arc<Window>,
    context: GpuContext,
    renderer: PlaneRenderer,
    operator: PlaybackOperator<WgpuBackend>,
    last_frame: Instant,
}

pub struct MixerApp {
    config: Config,
    settings: OperatorSettings,
    status: SharedStatus,
    should_exit: Arc<AtomicBool>,
    running: Option<Running>,
}

impl MixerApp {
    pub fn new(
        config: Config,
        settings: OperatorSettings,
        status: SharedStatus,
        should_exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            settings,
            status,
            should_exit,
            running: None,
        }
    }

    fn start(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<Running> {
        let mut attrs = WindowAttributes::default()
            .with_title("vmix")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));
        if self.config.general.fullscreen {
            attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        let window = Arc::new(event_loop.create_window(attrs)?);

        let context = pollster::block_on(GpuContext::new(Arc::clone(&window)))?;
        let capabilities =
            ImportCapabilities::from_context(&context, self.config.advanced.allow_dmabuf);
        let backend = WgpuBackend::new(&context, capabilities);
        let renderer = PlaneRenderer::new(&context, self.settings.outputs);

        let mut operator = PlaybackOperator::new(
            self.settings.clone(),
            backend,
            Box::new(GstSourceFactory::from_config(&self.config)),
            Box::new(LogReporter::new()),
        );
        operator.initialize();

        Ok(Running {
            window,
            context,
            renderer,
            operator,
            last_frame: Instant::now(),
        })
    }

    fn stop(&self, event_loop: &ActiveEventLoop) {
        self.should_exit.store(true, Ordering::Release);
        event_loop.exit();
    }
}

impl Running {
    fn redraw(&mut self, status: &SharedStatus) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame);
        self.last_frame = now;

        self.operator.update(dt);
        *status.write() = self.operator.status();

        let frame = match self.context.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Skipping frame: {}", e);
                return;
            }
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let (width, height) = self.context.size();

        self.renderer.begin_frame(view, width, height);
        for output in 0..self.operator.mixers().len() {
            log_and_continue!(
                self.operator.render_plane(output, &mut self.renderer),
                format!("render output {}", output)
            );
        }
        self.renderer.end_frame();

        self.window.pre_present_notify();
        frame.present();
    }
}

impl ApplicationHandler<AppEvent> for MixerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }

        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.running = Some(running);
                log::info!("Mixer window ready");
            }
            Err(e) => {
                log::error!("Failed to start mixer: {:#}", e);
                self.stop(event_loop);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => self.stop(event_loop),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.stop(event_loop),
            WindowEvent::Resized(size) => {
                running.context.resize(size.width, size.height);
            }
            WindowEvent::RedrawRequested => {
                running.redraw(&self.status);
                running.window.request_redraw();
            }
            _ => {}
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: AppEvent) {
        match event {
            AppEvent::Ipc(request) => {
                let Some(running) = self.running.as_mut() else {
                    let _ = request.reply.send(Response::Error(MixerError::ShuttingDown));
                    return;
                };
                let kill = matches!(request.command, Command::Kill);
                let response = ipc_server::execute(&mut running.operator, request.command);
                *self.status.write() = running.operator.status();
                if request.reply.send(response).is_err() {
                    log::debug!("Client went away before the reply");
                }
                if kill {
                    self.stop(event_loop);
                }
            }
            AppEvent::Shutdown => {
                log::info!("Shutdown requested");
                self.stop(event_loop);
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.should_exit.store(true, Ordering::Release);
        // Sources must release their GPU images before the device goes away
        if let Some(mut running) = self.running.take() {
            running.operator.shutdown();
            *self.status.write() = running.operator.status();
        }
    }
}
