//! Module loading, reference counting and device I/O

mod common;

use common::init_test_logging;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tek_exec::{
    reply_msg, Envelope, Exec, ExecConfig, ExecError, IoError, IoRequest, Module, ModuleEntry,
    ModuleFlags, ModuleHandle, MsgId, Task, TaskBuilder,
};

const CMD_QUICK: u16 = 1;
const CMD_QUEUED: u16 = 2;

#[derive(Default)]
struct Device {
    inits: AtomicUsize,
    exits: AtomicUsize,
    opens: AtomicUsize,
    init_delay: Option<Duration>,
    max_openers: Option<usize>,
    vectors: Option<usize>,
    fail_init: bool,
    pending: Mutex<Vec<Box<Envelope<IoRequest>>>>,
}

impl Device {
    fn complete_pending(&self, actual: usize) -> usize {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        let count = pending.len();
        for mut request in pending {
            request.body.actual = actual;
            reply_msg(request);
        }
        count
    }
}

struct Registered(Arc<Device>, &'static str);

impl ModuleEntry for Registered {
    fn name(&self) -> &str {
        self.1
    }

    fn version(&self) -> u16 {
        2
    }

    fn flags(&self) -> ModuleFlags {
        let mut flags = ModuleFlags::NONE;
        if self.0.vectors.is_some() {
            flags = flags | ModuleFlags::VECTORTABLE;
        }
        if self.0.max_openers.is_some() {
            flags = flags | ModuleFlags::OPENCLOSE;
        }
        flags
    }

    fn vector_count(&self) -> usize {
        self.0.vectors.unwrap_or(tek_exec::MODULE_RESERVED_VECTORS)
    }

    fn instance_size(&self) -> usize {
        16
    }

    fn init(&self, module: &Module) -> bool {
        if let Some(delay) = self.0.init_delay {
            std::thread::sleep(delay);
        }
        self.0.inits.fetch_add(1, Ordering::SeqCst);
        module.with_body(|body| body[0] = 0xa5);
        !self.0.fail_init
    }

    fn exit(&self, _module: &Module) {
        self.0.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn open(&self, _module: &Arc<Module>, task: &Task) -> Option<ModuleHandle> {
        let opened = self.0.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if opened > self.0.max_openers.unwrap_or(usize::MAX) {
            self.0.opens.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Box::new(task.id()))
    }

    fn close(&self, _module: &Module, _handle: Option<ModuleHandle>) {
        self.0.opens.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin_io(
        &self,
        _module: &Arc<Module>,
        mut request: Box<Envelope<IoRequest>>,
    ) -> Option<Box<Envelope<IoRequest>>> {
        match request.body.command {
            CMD_QUICK => {
                let len = request
                    .body
                    .payload
                    .as_ref()
                    .and_then(|p| p.downcast_ref::<Vec<u8>>())
                    .map_or(0, Vec::len);
                request.body.actual = len;
                Some(request)
            }
            CMD_QUEUED => {
                self.0.pending.lock().push(request);
                None
            }
            _ => {
                request.body.error = Some(IoError::UnknownCommand);
                Some(request)
            }
        }
    }

    fn abort_io(&self, _module: &Arc<Module>, id: MsgId) -> bool {
        let mut pending = self.0.pending.lock();
        let Some(index) = pending.iter().position(|r| r.id() == id) else {
            return false;
        };
        let mut request = pending.remove(index);
        drop(pending);
        request.body.error = Some(IoError::Aborted);
        reply_msg(request);
        true
    }
}

fn start_with(device: &Arc<Device>, name: &'static str) -> Exec {
    init_test_logging();
    Exec::start(ExecConfig::default().with_module(Arc::new(Registered(device.clone(), name))))
        .unwrap()
}

#[test]
fn test_open_close_refcount() {
    let device = Arc::new(Device::default());
    let exec = start_with(&device, "dev.plain");
    let main = exec.main_task();

    let first = main.open_module("dev.plain", 1).unwrap();
    let second = main.open_module("dev.plain", 2).unwrap();
    assert!(Arc::ptr_eq(first.module(), second.module()));
    assert!(first.module().is_initialized());
    assert_eq!(first.module().with_body(|body| body[0]), Some(0xa5));
    assert_eq!(device.inits.load(Ordering::SeqCst), 1);
    assert_eq!(exec.module_refcount("dev.plain"), Some(2));

    main.close_module(first).unwrap();
    assert_eq!(exec.module_refcount("dev.plain"), Some(1));
    assert_eq!(device.exits.load(Ordering::SeqCst), 0);
    main.close_module(second).unwrap();
    assert_eq!(exec.module_refcount("dev.plain"), None);
    assert_eq!(device.exits.load(Ordering::SeqCst), 1);

    // reopening loads afresh
    let again = main.open_module("dev.plain", 0).unwrap();
    assert_eq!(device.inits.load(Ordering::SeqCst), 2);
    main.close_module(again).unwrap();
}

#[test]
fn test_open_errors() {
    let device = Arc::new(Device::default());
    let exec = start_with(&device, "dev.versioned");
    let main = exec.main_task();

    assert!(matches!(
        main.open_module("dev.versioned", 3),
        Err(ExecError::ModuleVersion { have: 2, want: 3, .. })
    ));
    assert!(matches!(
        main.open_module("dev.missing", 0),
        Err(ExecError::ModuleNotFound(_))
    ));
    assert_eq!(device.inits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_failed_loads() {
    let short = Arc::new(Device {
        vectors: Some(4),
        ..Default::default()
    });
    let exec = start_with(&short, "dev.short");
    let main = exec.main_task();
    assert!(matches!(
        main.open_module("dev.short", 1),
        Err(ExecError::BadVectorTable(_))
    ));
    assert_eq!(short.inits.load(Ordering::SeqCst), 0);
    assert_eq!(exec.module_refcount("dev.short"), None);

    let broken = Arc::new(Device {
        fail_init: true,
        vectors: Some(12),
        ..Default::default()
    });
    main.add_modules([Arc::new(Registered(broken.clone(), "dev.broken")) as Arc<dyn ModuleEntry>])
        .unwrap();
    assert!(matches!(
        main.open_module("dev.broken", 1),
        Err(ExecError::ModuleInitFailed(_))
    ));
    assert_eq!(broken.inits.load(Ordering::SeqCst), 1);
    assert_eq!(broken.exits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_refused_opener_releases_reference() {
    let device = Arc::new(Device {
        max_openers: Some(1),
        ..Default::default()
    });
    let exec = start_with(&device, "dev.single");
    let main = exec.main_task();

    let first = main.open_module("dev.single", 1).unwrap();
    assert_eq!(
        first.handle().and_then(|h| h.downcast_ref::<tek_exec::TaskId>()),
        Some(&main.id())
    );
    assert!(matches!(
        main.open_module("dev.single", 1),
        Err(ExecError::ModuleOpenFailed(_))
    ));
    assert_eq!(exec.module_refcount("dev.single"), Some(1));
    main.close_module(first).unwrap();
    assert_eq!(device.opens.load(Ordering::SeqCst), 0);
    assert_eq!(device.exits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_openers_share_one_init() {
    let device = Arc::new(Device {
        init_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let exec = start_with(&device, "dev.slow");
    let main = exec.main_task();

    let (tx, rx) = crossbeam::channel::unbounded();
    let children: Vec<_> = (0..3)
        .map(|_| {
            let tx = tx.clone();
            main.create_task(TaskBuilder::new().run(move |task| {
                let instance = task.open_module("dev.slow", 2).unwrap();
                let initialized = instance.module().is_initialized();
                task.close_module(instance).unwrap();
                tx.send(initialized).unwrap();
            }))
            .unwrap()
        })
        .collect();
    for _ in 0..3 {
        assert!(rx.recv().unwrap());
    }
    for child in &children {
        main.destroy_task(child).unwrap();
    }
    assert!(device.inits.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        device.inits.load(Ordering::SeqCst),
        device.exits.load(Ordering::SeqCst)
    );
}

#[test]
fn test_quick_and_queued_io() {
    let device = Arc::new(Device::default());
    let exec = start_with(&device, "dev.io");
    let main = exec.main_task();
    let instance = main.open_module("dev.io", 2).unwrap();

    let mut request = main.alloc_request(&instance);
    request.body.command = CMD_QUICK;
    request.body.payload = Some(Box::new(vec![1u8, 2, 3]));
    let done = main.do_io(request);
    assert_eq!(done.body.error, None);
    assert_eq!(done.body.actual, 3);

    let mut request = main.alloc_request(&instance);
    request.body.command = CMD_QUEUED;
    let id = main.put_io(request);
    assert!(!main.check_io(id));
    assert_eq!(device.complete_pending(512), 1);
    assert!(main.check_io(id));
    let done = main.wait_io(id);
    assert_eq!(done.body.actual, 512);

    let mut request = main.alloc_request(&instance);
    request.body.command = 99;
    let id = main.put_io(request);
    assert!(main.check_io(id));
    assert_eq!(main.wait_io(id).body.error, Some(IoError::UnknownCommand));

    main.close_module(instance).unwrap();
}

#[test]
fn test_abort_io() {
    let device = Arc::new(Device::default());
    let exec = start_with(&device, "dev.abort");
    let main = exec.main_task();
    let instance = main.open_module("dev.abort", 2).unwrap();

    let mut request = main.alloc_request(&instance);
    request.body.command = CMD_QUEUED;
    let id = main.put_io(request);
    assert!(main.abort_io(&instance, id));
    assert!(!main.abort_io(&instance, id));
    assert_eq!(main.wait_io(id).body.error, Some(IoError::Aborted));
    assert_eq!(device.complete_pending(0), 0);

    main.close_module(instance).unwrap();
}
