//! Task catalog against the virtual device.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sdlink::fs::entry::attr;
use sdlink::fs::lfn::{encode_lfn, lfn_checksum};
use sdlink::fs::{FatFs, FormatOptions, MemoryCard};
use sdlink::port::VirtualDevice;
use sdlink::settings::RegisterSet;
use sdlink::task::catalog::{
    DeleteTask, DeviceInfoTask, ExportFileTask, ExportFolderTask, ImportFileTask, ImportFolderTask,
    LaunchSketchTask, ListDirectoryTask, ListSketchesTask, LoadIconTask, ReadRegistersTask,
    ReadSettingsTask, RenameTask, RenameVolumeTask, UpdateRegistersTask, UploadFirmwareTask,
    UploadProgramTask,
};
use sdlink::task::{EngineConfig, Task, TaskEngine, TaskHandle};
use sdlink::{BlockDevice, Error, SessionConfig};
use tempfile::TempDir;

fn config() -> EngineConfig {
    EngineConfig {
        keep_alive: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        progress_grace: Duration::ZERO,
        session: SessionConfig {
            read_timeout: Duration::from_millis(200),
            device_timeout: Duration::from_secs(60),
            reset_settle: Duration::from_millis(20),
        },
        ..EngineConfig::default()
    }
}

fn open(card: MemoryCard) -> (TaskEngine, VirtualDevice) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = VirtualDevice::new(card);
    let engine = TaskEngine::open(Box::new(device.clone()), config()).unwrap();
    (engine, device)
}

fn fat16() -> MemoryCard {
    MemoryCard::format(&FormatOptions::fat16(2048, 1))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

/// Put files into the root of a card before it goes into the device.
fn with_files(card: MemoryCard, files: &[(&str, &[u8])]) -> MemoryCard {
    let mut fs = FatFs::new(card);
    let root = fs.root_pointer().unwrap();
    for (name, data) in files {
        let mut info = fs.create_entry(root, name, attr::ARCHIVE).unwrap();
        fs.write_file(&mut info, &mut &data[..], data.len() as u64, &mut |_| Ok(()))
            .unwrap();
    }
    fs.flush().unwrap();
    fs.into_device()
}

/// Filesystem over a snapshot of the device's card.
fn snapshot(device: &VirtualDevice) -> FatFs<MemoryCard> {
    FatFs::new(MemoryCard::from_image(device.card_image()).unwrap())
}

fn used_clusters<D: BlockDevice>(fs: &mut FatFs<D>) -> usize {
    let last = fs.volume().unwrap().cluster_last;
    (2..=last)
        .filter(|&c| fs.fat_get(c).unwrap() != 0)
        .count()
}

fn list(engine: &TaskEngine, path: &str) -> Vec<String> {
    let task = ListDirectoryTask::new(path);
    let output = task.output();
    engine.execute(task, false).result().unwrap();
    output
        .take()
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

fn wait_for_progress(handle: &TaskHandle, at_least: f32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.progress() < at_least && !handle.is_finished() {
        assert!(Instant::now() < deadline, "task made no progress");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn import_then_export_1300_bytes() {
    let (engine, device) = open(fat16());
    let host = TempDir::new().unwrap();
    let source = host.path().join("sample.bin");
    let data = pattern(1300);
    fs::write(&source, &data).unwrap();

    engine
        .execute(ImportFileTask::new(&source, "/"), false)
        .result()
        .unwrap();

    let mut card = snapshot(&device);
    let root = card.root_pointer().unwrap();
    let info = card.find(root, "sample.bin").unwrap().unwrap();
    assert_eq!(info.size(), 1300);
    assert_eq!(card.chain(info.first_cluster()).unwrap().len(), 3);

    let dest = host.path().join("back.bin");
    engine
        .execute(ExportFileTask::new("/sample.bin", &dest), false)
        .result()
        .unwrap();
    assert_eq!(fs::read(&dest).unwrap(), data);
}

#[test]
fn cancelled_import_leaves_no_file() {
    let (engine, device) = open(fat16());
    let host = TempDir::new().unwrap();
    let source = host.path().join("large.bin");
    fs::write(&source, pattern(100 * 1024)).unwrap();
    device.set_latency(Duration::from_millis(2));

    let handle = engine.execute(ImportFileTask::new(&source, "/"), true);
    wait_for_progress(&handle, 0.25);
    engine.cancel_tasks();
    handle.wait();
    assert!(handle.error().is_none(), "cancel is not an error");
    assert!(handle.progress() < 1.0);

    device.set_latency(Duration::ZERO);
    assert!(list(&engine, "/").is_empty());
    drop(engine);
    assert_eq!(used_clusters(&mut snapshot(&device)), 0);
}

#[test]
fn cancelled_export_removes_host_file() {
    let card = with_files(fat16(), &[("movie.bin", &pattern(200 * 1024))]);
    let (engine, device) = open(card);
    let host = TempDir::new().unwrap();
    let dest = host.path().join("movie.bin");
    device.set_latency(Duration::from_millis(2));

    let handle = engine.execute(ExportFileTask::new("/movie.bin", &dest), true);
    wait_for_progress(&handle, 0.1);
    handle.cancel();
    handle.wait();
    assert!(handle.error().is_none());
    assert!(!dest.exists());
}

#[test]
fn folder_round_trip_with_long_names() {
    let (engine, _device) = open(MemoryCard::format(&FormatOptions::fat32(8192, 1)));
    let host = TempDir::new().unwrap();
    let tree = host.path().join("Project Files");
    fs::create_dir_all(tree.join("nested dir")).unwrap();
    fs::write(tree.join("readme.txt"), b"hello card").unwrap();
    fs::write(tree.join("nested dir").join("A rather long file name.dat"), pattern(3000)).unwrap();

    engine
        .execute(ImportFolderTask::new(&tree, "/"), false)
        .result()
        .unwrap();
    assert_eq!(list(&engine, "/"), vec!["Project Files"]);
    let mut inner = list(&engine, "/Project Files");
    inner.sort();
    assert_eq!(inner, vec!["nested dir", "readme.txt"]);

    let out = host.path().join("out");
    fs::create_dir(&out).unwrap();
    engine
        .execute(ExportFolderTask::new("/Project Files", &out), false)
        .result()
        .unwrap();
    let exported = out.join("Project Files");
    assert_eq!(fs::read(exported.join("readme.txt")).unwrap(), b"hello card");
    assert_eq!(
        fs::read(exported.join("nested dir").join("A rather long file name.dat")).unwrap(),
        pattern(3000)
    );
}

#[test]
fn delete_rename_and_label() {
    let card = with_files(fat16(), &[("one.txt", b"1"), ("two.txt", b"22")]);
    let (engine, device) = open(card);

    let rename = RenameTask::new("/one.txt", "First entry.txt");
    let renamed = rename.output();
    engine.execute(rename, false).result().unwrap();
    assert_eq!(renamed.take().unwrap().name, "First entry.txt");

    engine
        .execute(DeleteTask::new(vec!["/two.txt".into()]), false)
        .result()
        .unwrap();
    assert_eq!(list(&engine, "/"), vec!["First entry.txt"]);

    engine
        .execute(RenameVolumeTask::new("sdcard"), false)
        .result()
        .unwrap();
    drop(engine);
    let mut card = snapshot(&device);
    assert_eq!(card.volume_label().unwrap().as_deref(), Some("SDCARD"));
    assert_eq!(used_clusters(&mut card), 1);
}

#[test]
fn delete_missing_path_fails() {
    let (engine, _device) = open(fat16());
    let handle = engine.execute(DeleteTask::new(vec!["/nope".into()]), false);
    assert!(matches!(handle.result(), Err(Error::NotFound(_))));
}

#[test]
fn sync_batch_stops_after_failure() {
    let (engine, _device) = open(fat16());
    let tasks: Vec<Box<dyn Task>> = vec![
        Box::new(ImportFileTask::new("/definitely/not/here.bin", "/")),
        Box::new(ListDirectoryTask::new("/")),
    ];
    let handles = engine.execute_all(tasks, false);
    assert!(matches!(handles[0].take_error(), Some(Error::Io(_))));
    assert!(handles[1].is_finished());
    assert!(handles[1].cancel_requested());
    assert!(!handles[1].has_failed());
}

#[test]
fn sketches_icons_and_launch() {
    let blink = pattern(700);
    let card = with_files(
        fat16(),
        &[
            ("BLINK.HEX", &blink),
            ("BLINK.SKI", b"icon-bytes"),
            ("SNAKE.HEX", b"snake"),
            ("notes.txt", b"-"),
        ],
    );
    let (engine, device) = open(card);

    let task = ListSketchesTask::new();
    let sketches = task.output();
    engine.execute(task, false).result().unwrap();
    let sketches = sketches.take().unwrap();
    assert_eq!(sketches.len(), 2);
    assert_eq!(sketches[0].name, "BLINK");
    assert_eq!(sketches[0].icon.as_deref(), Some("BLINK.SKI"));
    assert_eq!(sketches[1].icon, None);

    let icon = LoadIconTask::new("blink");
    let bytes = icon.output();
    engine.execute(icon, false).result().unwrap();
    assert_eq!(bytes.take().unwrap().as_deref(), Some(&b"icon-bytes"[..]));

    engine
        .execute(LaunchSketchTask::new("blink"), false)
        .result()
        .unwrap();
    assert!(device.sketch_running());
    let settings = device.settings();
    assert_eq!(settings.current_sketch_name().as_deref(), Some("BLINK.HEX"));
    assert_eq!(settings.sketch_size, 700);
    assert!(!settings.load_sketch);
    assert_eq!(&device.flash()[..700], &blink[..]);

    // The next task brings the device back into command mode.
    assert_eq!(list(&engine, "/").len(), 4);
    assert!(!device.sketch_running());
}

#[test]
fn upload_program_and_firmware() {
    let (engine, device) = open(fat16());
    let program = pattern(1000);
    engine
        .execute(UploadProgramTask::new(program.clone(), 0x200), false)
        .result()
        .unwrap();
    assert_eq!(&device.flash()[0x200..0x200 + 1000], &program[..]);

    let misaligned = engine.execute(UploadProgramTask::new(vec![1], 3), false);
    assert!(matches!(misaligned.result(), Err(Error::Config(_))));

    let firmware = pattern(2000);
    engine
        .execute(UploadFirmwareTask::new(firmware.clone()), false)
        .result()
        .unwrap();
    assert_eq!(&device.firmware()[..2000], &firmware[..]);
    assert!(!device.settings().service_requested);

    let info = DeviceInfoTask::new();
    let output = info.output();
    engine.execute(info, false).result().unwrap();
    let info = output.take().unwrap();
    assert_eq!(info.name, "SDLINK_1");
    assert_eq!(info.signature, [0x1E, 0x98, 0x01]);
    assert!(info.volume.is_some());
}

#[test]
fn registers_and_settings() {
    let (engine, _device) = open(fat16());
    let set = RegisterSet::standard();

    let update = UpdateRegistersTask::new(set.clone(), vec![("PORTB".into(), 0x5A), ("SP".into(), 0x21FF)]);
    let changed = update.output();
    engine.execute(update, false).result().unwrap();
    assert_eq!(changed.take(), Some(3));

    let read = ReadRegistersTask::new(set);
    let values = read.output();
    engine.execute(read, false).result().unwrap();
    let values = values.take().unwrap();
    let value = |name: &str| values.iter().find(|v| v.name == name).unwrap().value;
    assert_eq!(value("PORTB"), 0x5A);
    assert_eq!(value("SP"), 0x21FF);
    assert_eq!(value("DDRB"), 0);

    let settings = ReadSettingsTask::new();
    let output = settings.output();
    engine.execute(settings, false).result().unwrap();
    assert_eq!(output.take().unwrap().current_sketch_name(), None);
}

#[test]
fn transient_link_failure_is_retried() {
    let (engine, device) = open(fat16());
    assert!(list(&engine, "/").is_empty());
    let resets = device.stats().resets;

    let host = TempDir::new().unwrap();
    let source = host.path().join("retry.bin");
    fs::write(&source, pattern(5000)).unwrap();
    device.drop_next_response();
    engine
        .execute(ImportFileTask::new(&source, "/"), false)
        .result()
        .unwrap();
    assert_eq!(device.stats().resets, resets + 1);

    drop(engine);
    let mut card = snapshot(&device);
    let root = card.root_pointer().unwrap();
    let info = card.find(root, "retry.bin").unwrap().unwrap();
    let mut back = Vec::new();
    card.read_file(&info, &mut back, &mut |_| Ok(())).unwrap();
    assert_eq!(back, pattern(5000));
}

#[test]
fn events_report_task_results() {
    let (engine, _device) = open(fat16());
    let events = engine.subscribe();
    let handle: Arc<TaskHandle> = engine.execute(DeleteTask::new(vec!["/missing".into()]), false);
    assert!(handle.has_failed());
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let event = events
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap();
        if let sdlink::Event::TaskFinished { error, .. } = event {
            assert!(error.unwrap().contains("missing"));
            break;
        }
    }
}

#[test]
fn exporting_a_directory_as_a_file_fails() {
    let (engine, _device) = open(fat16());
    let host = TempDir::new().unwrap();
    let dir = host.path().join("d");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("x"), b"x").unwrap();
    engine
        .execute(ImportFolderTask::new(&dir, "/"), false)
        .result()
        .unwrap();
    let handle = engine.execute(ExportFileTask::new("/d", Path::new("/tmp")), false);
    assert!(matches!(handle.result(), Err(Error::Filesystem(_))));
}

#[test]
fn folder_export_refuses_names_that_leave_the_destination() {
    // Another tool left a long name that climbs out of the folder.
    let mut card = FatFs::new(fat16());
    let root = card.root_pointer().unwrap();
    let docs = card.create_directory(root, "docs").unwrap();
    let dir = card.open_entry(&docs).unwrap();
    let data = pattern(100);
    let mut info = card.create_entry(dir, "evilname.txt", attr::ARCHIVE).unwrap();
    card.write_file(&mut info, &mut &data[..], data.len() as u64, &mut |_| Ok(()))
        .unwrap();
    let fragments = encode_lfn("../escape.txt", lfn_checksum(info.entry.short_name()));
    assert_eq!(fragments.len(), 1);
    card.write_entry(info.first, &fragments[0]).unwrap();
    card.flush().unwrap();

    let (engine, _device) = open(card.into_device());
    assert_eq!(list(&engine, "/docs"), vec!["../escape.txt".to_string()]);

    let host = TempDir::new().unwrap();
    let out = host.path().join("out");
    fs::create_dir(&out).unwrap();
    let handle = engine.execute(ExportFolderTask::new("/docs", &out), false);
    assert!(matches!(handle.result(), Err(Error::Filesystem(_))));
    assert!(!out.join("escape.txt").exists());
    assert!(!host.path().join("escape.txt").exists());
}
