//! Process lifecycle driver.
//!
//! [`Server::run`] drives a [`Service`] through a fixed sequence:
//!
//! 1. build the tokio runtime and install signal handling,
//! 2. call `init` once (a `false` result aborts the run),
//! 3. call `main_loop` until the close flag is set,
//! 4. call `finalize`.
//!
//! SIGHUP requests a reload, which is delivered between two `main_loop`
//! calls. SIGINT, SIGQUIT, SIGABRT and SIGTERM set the close flag. SIGPIPE is
//! swallowed. A panic in any hook is logged with a backtrace and ends the
//! run; `finalize` is still called.

use std::backtrace::Backtrace;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{error, info, trace};

/// Hooks implemented by the embedding application.
pub trait Service {
    /// One-time setup. Returning `false` aborts startup.
    fn init(&mut self) -> bool;

    /// One iteration of the main loop. Called until the server is closed, so
    /// implementations should block or sleep for a tick.
    fn main_loop(&mut self);

    /// Re-read configuration after SIGHUP.
    fn reload(&mut self);

    /// Teardown. Called once, even if `init` failed.
    fn finalize(&mut self) -> bool;
}

/// Cloneable control handle for a running [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerHandle {
    closed: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the main loop to exit after the current iteration.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ask for `Service::reload` before the next main loop iteration.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }
}

/// Template-method driver for a [`Service`].
#[derive(Debug)]
pub struct Server {
    handle: ServerHandle,
    worker_threads: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a driver that uses one runtime worker per CPU.
    pub fn new() -> Self {
        Self {
            handle: ServerHandle::default(),
            worker_threads: num_cpus(),
        }
    }

    /// Set the runtime worker count: `n > 0` uses `n`, `-1` uses every CPU.
    /// Other values leave the setting unchanged.
    pub fn set_cpu_num(&mut self, num: i32) {
        if num > 0 {
            self.worker_threads = num as usize;
        } else if num == -1 {
            self.worker_threads = num_cpus();
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Run `service` to completion. Returns `false` if the runtime could not
    /// be built, `init` failed, or a hook panicked.
    pub fn run<S: Service>(&self, service: &mut S) -> bool {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Failed to build runtime");
                return false;
            }
        };

        install_panic_hook();

        let ok = {
            let _guard = runtime.enter();
            if let Err(e) = spawn_signal_listener(self.handle.clone()) {
                error!(error = %e, "Failed to install signal handlers");
            }

            let ok = match panic::catch_unwind(AssertUnwindSafe(|| self.drive(service))) {
                Ok(ok) => ok,
                Err(_) => {
                    error!("Service aborted by panic");
                    false
                }
            };

            match panic::catch_unwind(AssertUnwindSafe(|| service.finalize())) {
                Ok(true) => {}
                Ok(false) => error!("Finalize reported failure"),
                Err(_) => error!("Finalize aborted by panic"),
            }
            ok
        };

        runtime.shutdown_timeout(Duration::from_secs(1));
        info!("Server shutdown complete");
        ok
    }

    fn drive<S: Service>(&self, service: &mut S) -> bool {
        info!(workers = self.worker_threads, "Initializing");
        if !service.init() {
            error!("Initialization failed");
            return false;
        }
        info!("Initialization complete");

        while !self.handle.is_closed() {
            if self.handle.take_reload() {
                info!("Reloading configuration");
                service.reload();
            }
            service.main_loop();
        }
        true
    }
}

static PANIC_HOOK: Once = Once::new();

/// Log panics with a backtrace, then defer to the hook that was installed
/// before. Installed once per process and never removed.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            error!(panic = %info, backtrace = %Backtrace::force_capture(), "Panic");
            previous(info);
        }));
    });
}

#[cfg(unix)]
fn spawn_signal_listener(handle: ServerHandle) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut pipe = signal(SignalKind::pipe())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut abort = signal(SignalKind::from_raw(libc::SIGABRT))?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = hangup.recv() => {
                    info!(signal = "SIGHUP", "Reload requested");
                    handle.request_reload();
                    continue;
                }
                Some(()) = pipe.recv() => {
                    trace!(signal = "SIGPIPE", "Signal ignored");
                    continue;
                }
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = quit.recv() => "SIGQUIT",
                Some(()) = abort.recv() => "SIGABRT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            info!(signal = name, "Shutdown requested");
            handle.close();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(handle: ServerHandle) -> io::Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "Shutdown requested");
            handle.close();
        }
    });
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(5);

    #[derive(Default)]
    struct Script {
        handle: ServerHandle,
        init_ok: bool,
        loops: usize,
        stop_after: usize,
        reloads: usize,
        finals: usize,
        reload_at: Option<usize>,
        panic_at: Option<usize>,
        in_runtime: bool,
    }

    impl Service for Script {
        fn init(&mut self) -> bool {
            // The runtime is entered while hooks run.
            self.in_runtime = tokio::runtime::Handle::try_current().is_ok();
            self.init_ok
        }

        fn main_loop(&mut self) {
            self.loops += 1;
            if Some(self.loops) == self.reload_at {
                self.handle.request_reload();
            }
            if Some(self.loops) == self.panic_at {
                panic!("main loop failure");
            }
            if self.loops >= self.stop_after {
                self.handle.close();
            }
            std::thread::sleep(TICK);
        }

        fn reload(&mut self) {
            self.reloads += 1;
        }

        fn finalize(&mut self) -> bool {
            self.finals += 1;
            true
        }
    }

    fn server() -> Server {
        let mut server = Server::new();
        server.set_cpu_num(1);
        server
    }

    #[test]
    fn test_runs_until_closed() {
        let server = server();
        let mut script = Script {
            handle: server.handle(),
            init_ok: true,
            stop_after: 5,
            reload_at: Some(2),
            ..Script::default()
        };

        assert!(server.run(&mut script));
        assert_eq!(script.loops, 5);
        assert!(script.reloads >= 1);
        assert_eq!(script.finals, 1);
        assert!(script.in_runtime);
        assert!(server.is_closed());
    }

    #[test]
    fn test_init_failure_still_finalizes() {
        let server = server();
        let mut script = Script {
            handle: server.handle(),
            init_ok: false,
            stop_after: 1,
            ..Script::default()
        };

        assert!(!server.run(&mut script));
        assert_eq!(script.loops, 0);
        assert_eq!(script.finals, 1);
    }

    #[test]
    fn test_panic_is_contained() {
        let server = server();
        let mut script = Script {
            handle: server.handle(),
            init_ok: true,
            stop_after: 100,
            panic_at: Some(3),
            ..Script::default()
        };

        assert!(!server.run(&mut script));
        assert_eq!(script.loops, 3);
        assert_eq!(script.finals, 1);
    }

    #[test]
    fn test_closed_before_run_skips_main_loop() {
        let server = server();
        server.close();
        let mut script = Script {
            handle: server.handle(),
            init_ok: true,
            stop_after: 1,
            ..Script::default()
        };

        assert!(server.run(&mut script));
        assert_eq!(script.loops, 0);
        assert_eq!(script.finals, 1);
    }

    #[test]
    fn test_overlapping_runs() {
        let runs: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    let server = server();
                    let mut script = Script {
                        handle: server.handle(),
                        init_ok: true,
                        stop_after: 3 + i,
                        panic_at: (i % 2 == 0).then_some(2),
                        ..Script::default()
                    };
                    let ok = server.run(&mut script);
                    (i, ok, script.finals)
                })
            })
            .collect();

        for run in runs {
            let (i, ok, finals) = run.join().unwrap();
            assert_eq!(ok, i % 2 != 0);
            assert_eq!(finals, 1);
        }
        assert!(PANIC_HOOK.is_completed());
    }

    #[test]
    fn test_set_cpu_num() {
        let mut server = Server::new();
        server.set_cpu_num(3);
        assert_eq!(server.worker_threads(), 3);
        server.set_cpu_num(0);
        assert_eq!(server.worker_threads(), 3);
        server.set_cpu_num(-1);
        assert_eq!(server.worker_threads(), num_cpus());
    }

    #[cfg(unix)]
    #[test]
    fn test_sighup_triggers_reload() {
        struct Hup {
            handle: ServerHandle,
            reloads: usize,
            loops: usize,
        }

        impl Service for Hup {
            fn init(&mut self) -> bool {
                // SAFETY: raising a signal that the runtime has a handler for.
                unsafe {
                    libc::raise(libc::SIGHUP);
                }
                true
            }

            fn main_loop(&mut self) {
                self.loops += 1;
                if self.reloads > 0 || self.loops > 1000 {
                    self.handle.close();
                }
                std::thread::sleep(TICK);
            }

            fn reload(&mut self) {
                self.reloads += 1;
            }

            fn finalize(&mut self) -> bool {
                true
            }
        }

        let server = server();
        let mut hup = Hup {
            handle: server.handle(),
            reloads: 0,
            loops: 0,
        };

        assert!(server.run(&mut hup));
        assert!(hup.reloads >= 1);
    }
}
