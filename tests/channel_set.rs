//! End-to-end scenarios against real `perf_event_open` counters. These
//! require a kernel that permits unprivileged PMU access (or running as
//! root / with `perf_event_paranoid` relaxed) and are marked `#[ignore]`
//! accordingly; run with `cargo test -- --ignored` on a suitable host.

use std::process::{Child, Command};
use std::thread::sleep;
use std::time::Duration;

use memaccess_sampler::{Channel, ChannelSet, EventClass, Error};

fn spawn_busy_child() -> Child {
    Command::new("sh")
        .args(&["-c", "while true; do :; done"])
        .spawn()
        .expect("failed to spawn busy child")
}

fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Debug)
        .try_init();
}

#[test]
#[ignore]
fn single_channel_basic_sampling() {
    init_logging();
    let mut child = spawn_busy_child();
    let mut channel = Channel::new();
    channel.bind(child.id() as i32, EventClass::Store).unwrap();
    channel.set_period(10_000).unwrap();

    let mut collected = Vec::new();
    while collected.len() < 100 {
        match channel.read_sample() {
            Ok(sample) => collected.push(sample),
            Err(Error::WouldBlock) => sleep(Duration::from_millis(5)),
            Err(e) => panic!("unexpected error reading sample: {:?}", e),
        }
    }

    for sample in &collected {
        assert_eq!(sample.event_class, EventClass::Store);
        assert_eq!(sample.pid as i32, child.id() as i32);
        assert!(sample.addr != 0);
    }

    let _ = child.kill();
}

#[test]
#[ignore]
fn set_lifecycle_and_diff_update() {
    init_logging();
    let mut p1 = spawn_busy_child();
    let mut p2 = spawn_busy_child();
    let mut p3 = spawn_busy_child();
    let mut p4 = spawn_busy_child();

    let mut set = ChannelSet::new();
    set.init(vec![EventClass::Load, EventClass::Store]).unwrap();
    set.set_period(10_000).unwrap();

    let pids123: std::collections::BTreeSet<i32> =
        [p1.id() as i32, p2.id() as i32, p3.id() as i32].into_iter().collect();
    set.update(&pids123).unwrap();

    let pids234: std::collections::BTreeSet<i32> =
        [p2.id() as i32, p3.id() as i32, p4.id() as i32].into_iter().collect();
    set.update(&pids234).unwrap();

    set.deinit();

    for child in [&mut p1, &mut p2, &mut p3, &mut p4] {
        let _ = child.kill();
    }
}

#[test]
#[ignore]
fn exit_detection_fires_on_exit_callback() {
    init_logging();
    let mut child = Command::new("sh")
        .args(&["-c", "sleep 0.1"])
        .spawn()
        .expect("failed to spawn short-lived child");
    let pid = child.id() as i32;

    let mut set = ChannelSet::new();
    set.init(vec![EventClass::Store]).unwrap();
    set.add(pid).unwrap();

    let mut exited = Vec::new();
    // generous timeout: the child should exit well inside 2s
    set.poll_samples(Some(2000), |_sample| {}, |p| exited.push(p))
        .unwrap();

    assert_eq!(exited, vec![pid]);
    assert!(set.remove(pid).is_ok());

    let _ = child.wait();
}

#[test]
#[ignore]
fn invalid_period_reports_invalid_argument_and_stays_usable() {
    init_logging();
    let mut child = spawn_busy_child();
    let mut channel = Channel::new();
    channel.bind(child.id() as i32, EventClass::Load).unwrap();

    let err = channel.set_period(1).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. } | Error::OsError(_)));

    channel.set_period(10_000).unwrap();

    let _ = child.kill();
}
