//! Transport session tests against the loopback backend
//!
//! These run complete sessions and check the order and count of collaborator
//! calls, and that teardown releases everything whatever phase failed.

use libnyx_remoteproc::loopback::{Call, Faults, Loopback};
use libnyx_remoteproc::{
    BootMode, CancelToken, CoreId, Error, ErrorKind, Platform, RetryPolicy, SessionConfig,
    ShutdownAck, TransportSession,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn session_with(faults: Faults, config: SessionConfig) -> (Arc<Loopback>, TransportSession) {
    let backend = Arc::new(Loopback::with_faults(faults));
    let session = TransportSession::new(Platform::from_backend(backend.clone()), config)
        .expect("valid config");
    (backend, session)
}

fn put_ids(backend: &Loopback) -> Vec<u16> {
    backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Put(id) => Some(id),
            _ => None,
        })
        .collect()
}

fn freed_ids(backend: &Loopback) -> Vec<u16> {
    backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Free(id) => Some(id),
            _ => None,
        })
        .collect()
}

/// Nothing acquired by the session is left behind
fn assert_released(backend: &Loopback) {
    assert_eq!(backend.open_handles(), 0, "core handle leaked");
    assert!(backend.registered_regions().is_empty(), "shared region leaked");
    assert!(backend.running_cores().is_empty(), "core left running");
    assert!(backend.local_queues().is_empty(), "local queue leaked");
    assert_eq!(backend.open_remote_queues(), 0, "remote queue left open");
    assert_eq!(backend.live_messages(), 0, "message leaked");
    assert_eq!(backend.count(|c| matches!(c, Call::Close(_))), 1);
}

#[test]
fn test_default_run_succeeds() {
    let (backend, mut session) = session_with(Faults::default(), SessionConfig::default());
    let report = session.run();

    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.exchanged, 3);
    assert_eq!(report.shutdown, ShutdownAck::Acknowledged);
    assert_eq!(put_ids(&backend), vec![0, 1, 2, 0xFFFF]);
    assert_eq!(freed_ids(&backend), vec![1, 2, 3, 0xFFFF]);
    assert_released(&backend);
}

#[test]
fn test_call_order() {
    let config = SessionConfig {
        iterations: 1,
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    assert!(session.run().is_success());

    let expected = vec![
        Call::Open(CoreId::SysM3),
        Call::TranslateAddr(0x9850_0000),
        Call::TranslateAddr(0x9854_0000),
        Call::AddRegion(0),
        Call::AddRegion(1),
        Call::Start(CoreId::SysM3),
        Call::Start(CoreId::AppM3),
        Call::CreateQueue("MQ_MPU".into()),
        Call::OpenQueue("MQ_CORE1".into()),
        Call::Alloc,
        Call::Put(0),
        Call::Get,
        Call::Free(1),
        Call::Alloc,
        Call::Put(0xFFFF),
        Call::Get,
        Call::Free(0xFFFF),
        Call::DeleteQueue("MQ_MPU".into()),
        Call::CloseQueue("MQ_CORE1".into()),
        Call::RemoveRegion(0),
        Call::RemoveRegion(1),
        Call::Stop(CoreId::AppM3),
        Call::Stop(CoreId::SysM3),
        Call::Close(CoreId::SysM3),
    ];
    assert_eq!(backend.calls(), expected);
}

#[test]
fn test_regions_registered_at_translated_bases() {
    let (_backend, mut session) = session_with(Faults::default(), SessionConfig::default());
    session.startup().unwrap();

    let offset = libnyx_remoteproc::loopback::SLAVE_OFFSET;
    let notify = session.regions().get(0).unwrap();
    assert_eq!(notify.base, 0x9850_0000 + offset);
    assert_eq!(notify.size, 0x4000);
    let data = session.regions().get(1).unwrap();
    assert_eq!(data.base, 0x9854_0000 + offset);
    assert_eq!(data.size, 0x5_4000);

    session.shutdown().unwrap();
}

#[test]
fn test_ids_cycle_modulo_16() {
    let config = SessionConfig {
        iterations: 20,
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    let report = session.run();

    assert!(report.is_success());
    assert_eq!(report.exchanged, 20);
    let mut expected: Vec<u16> = (0..20u16).map(|i| i % 16).collect();
    expected.push(0xFFFF);
    assert_eq!(put_ids(&backend), expected);
}

#[test]
fn test_rejected_put_still_tears_down() {
    let faults = Faults {
        fail_put: Some(2),
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(!report.is_success());
    assert_eq!(report.exchanged, 1);
    assert!(matches!(
        report.error,
        Some(Error::Collaborator { op: "MessageQ_put", .. })
    ));
    // The sentinel is still exchanged after the failed round trip
    assert_eq!(report.shutdown, ShutdownAck::Acknowledged);
    // Rejected message 1 went back to the heap
    assert_eq!(freed_ids(&backend), vec![1, 1, 0xFFFF]);
    assert_released(&backend);
}

#[test]
fn test_wrong_reply_id_is_integrity_failure() {
    let faults = Faults {
        corrupt_reply: Some(2),
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert_eq!(report.exchanged, 1);
    assert_eq!(
        report.error,
        Some(Error::ProtocolIntegrity {
            expected: 2,
            received: 3,
        })
    );
    assert_eq!(report.error_kind(), Some(ErrorKind::ProtocolIntegrity));
    // No further data messages after the mismatch
    assert_eq!(put_ids(&backend), vec![0, 1, 0xFFFF]);
    assert_released(&backend);
}

#[test]
fn test_sentinel_without_reply() {
    let faults = Faults {
        drop_sentinel_reply: true,
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(report.error.is_none());
    assert_eq!(report.shutdown, ShutdownAck::NoReply);
    assert!(!report.is_success());
    assert_eq!(report.error_kind(), None);
    assert_released(&backend);
}

#[test]
fn test_sentinel_answered_with_other_id() {
    let faults = Faults {
        sentinel_reply: Some(7),
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert_eq!(report.shutdown, ShutdownAck::Unexpected(7));
    assert!(report.error.is_none());
    assert_eq!(report.error_kind(), Some(ErrorKind::ProtocolIntegrity));
    assert!(!report.is_success());
    assert_released(&backend);
}

#[test]
fn test_bounded_reply_wait() {
    let faults = Faults {
        drop_sentinel_reply: true,
        ..Faults::default()
    };
    let config = SessionConfig {
        reply_timeout_ms: Some(5),
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(faults, config);

    let started = Instant::now();
    let report = session.run();
    assert!(started.elapsed() >= Duration::from_millis(5));

    assert_eq!(report.exchanged, 3);
    assert_eq!(report.shutdown, ShutdownAck::NoReply);
    assert_eq!(report.error_kind(), None);
    assert_released(&backend);
}

#[test]
fn test_sentinel_disabled() {
    let config = SessionConfig {
        shutdown_sentinel: false,
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    let report = session.run();

    assert!(report.is_success());
    assert_eq!(report.shutdown, ShutdownAck::Skipped);
    assert!(!put_ids(&backend).contains(&0xFFFF));
}

#[test]
fn test_rendezvous_waits_for_remote_queue() {
    let faults = Faults {
        queue_ready_after: 5,
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(report.is_success());
    assert_eq!(backend.count(|c| matches!(c, Call::OpenQueue(_))), 6);
}

#[test]
fn test_rendezvous_gives_up() {
    let faults = Faults {
        queue_ready_after: 10,
        ..Faults::default()
    };
    let config = SessionConfig {
        rendezvous: RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        },
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(faults, config);
    let report = session.run();

    assert_eq!(report.error_kind(), Some(ErrorKind::ResourceUnavailable));
    assert_eq!(report.exchanged, 0);
    assert_eq!(report.shutdown, ShutdownAck::NotSent);
    assert_eq!(backend.count(|c| matches!(c, Call::OpenQueue(_))), 3);
    assert_released(&backend);
}

#[test]
fn test_cancel_before_rendezvous() {
    let faults = Faults {
        queue_ready_after: u32::MAX,
        ..Faults::default()
    };
    let cancel = CancelToken::new();
    let (backend, session) = session_with(faults, SessionConfig::default());
    let mut session = session.with_cancel(cancel.clone());
    cancel.cancel();

    let report = session.run();
    assert_eq!(report.error, Some(Error::Cancelled));
    assert_eq!(backend.count(|c| matches!(c, Call::OpenQueue(_))), 0);
    assert_released(&backend);
}

#[test]
fn test_cancel_stops_exchange() {
    let (backend, mut session) = session_with(Faults::default(), SessionConfig::default());
    session.startup().unwrap();
    session.rendezvous().unwrap();

    session.cancel_token().cancel();
    assert_eq!(session.exchange(), Err(Error::Cancelled));
    assert!(put_ids(&backend).is_empty());

    // A cancelled session still says goodbye and releases everything
    assert_eq!(session.send_sentinel(), ShutdownAck::Acknowledged);
    session.shutdown().unwrap();
    assert_released(&backend);
}

#[test]
fn test_region_failure_tears_down() {
    let faults = Faults {
        fail_region_add: Some(1),
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(matches!(
        report.error,
        Some(Error::Collaborator { op: "SharedRegion_add", .. })
    ));
    assert_eq!(report.shutdown, ShutdownAck::NotSent);
    assert_eq!(backend.count(|c| matches!(c, Call::Start(_))), 0);
    assert_eq!(backend.count(|c| *c == Call::RemoveRegion(0)), 1);
    // Index 1 was never registered, so it is not removed
    assert_eq!(backend.count(|c| *c == Call::RemoveRegion(1)), 0);
    assert_released(&backend);
}

#[test]
fn test_failed_app_start_stops_both_cores() {
    let faults = Faults {
        fail_start: Some(CoreId::AppM3),
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(matches!(
        report.error,
        Some(Error::Collaborator { op: "ProcMgr_start", .. })
    ));
    let stops: Vec<Call> = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Stop(_)))
        .collect();
    assert_eq!(stops, vec![Call::Stop(CoreId::AppM3), Call::Stop(CoreId::SysM3)]);
    assert_released(&backend);
}

#[test]
fn test_open_failure() {
    let faults = Faults {
        fail_open: true,
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert!(matches!(
        report.error,
        Some(Error::OpenFailed { core: CoreId::SysM3, .. })
    ));
    assert_eq!(backend.count(|c| matches!(c, Call::AddRegion(_))), 0);
    assert_eq!(backend.count(|c| matches!(c, Call::Close(_))), 0);
}

#[test]
fn test_close_failure_is_reported() {
    let faults = Faults {
        fail_close: true,
        ..Faults::default()
    };
    let (backend, mut session) = session_with(faults, SessionConfig::default());
    let report = session.run();

    assert_eq!(report.exchanged, 3);
    assert_eq!(report.shutdown, ShutdownAck::Acknowledged);
    assert!(matches!(
        report.error,
        Some(Error::Collaborator { op: "ProcMgr_close", .. })
    ));
    assert_released(&backend);
}

#[test]
fn test_daemon_mode_never_boots() {
    let config = SessionConfig {
        boot: BootMode::Daemon,
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    let report = session.run();

    assert!(report.is_success());
    assert_eq!(
        backend.count(|c| matches!(c, Call::Start(_) | Call::Stop(_) | Call::Load(_))),
        0
    );
    assert_released(&backend);
}

#[test]
fn test_load_mode_loads_before_start() {
    let config = SessionConfig {
        boot: BootMode::Load,
        core_image: Some("ducati-m3-core0.xem3".into()),
        app_image: Some("ducati-m3-core1.xem3".into()),
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    assert!(session.run().is_success());

    let boot: Vec<Call> = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Load(_) | Call::Start(_)))
        .collect();
    assert_eq!(
        boot,
        vec![
            Call::Load(CoreId::SysM3),
            Call::Start(CoreId::SysM3),
            Call::Load(CoreId::AppM3),
            Call::Start(CoreId::AppM3),
        ]
    );
}

#[test]
fn test_shared_core_started_once() {
    let config = SessionConfig {
        app_core: Some("SysM3".into()),
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    assert!(session.run().is_success());
    assert_eq!(backend.count(|c| matches!(c, Call::Start(_))), 1);
}

#[test]
fn test_unknown_core_name() {
    let config = SessionConfig {
        core: "M4".into(),
        ..SessionConfig::default()
    };
    let (backend, mut session) = session_with(Faults::default(), config);
    let report = session.run();

    assert_eq!(report.error_kind(), Some(ErrorKind::InvalidArgument));
    assert!(backend.calls().is_empty());
}
