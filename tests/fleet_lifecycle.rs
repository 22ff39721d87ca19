use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use wa_fleet::config::Config;
use wa_fleet::coordinator::FleetCoordinator;
use wa_fleet::error::FleetError;
use wa_fleet::protocol::{DisconnectReason, MemoryProtocol, WaEvent};
use wa_fleet::registry::{ConnectionStatus, InstanceRecord, InstanceRegistry, MemoryRegistry};
use wa_fleet::session_store::{MemorySessionRepo, SessionRepo, SessionStore};

const HOOK: &str = "https://n8n.example.com/hook";

struct Fleet {
    coordinator: FleetCoordinator,
    registry: Arc<MemoryRegistry>,
    sessions: Arc<MemorySessionRepo>,
    protocol: Arc<MemoryProtocol>,
}

fn fast_config() -> Config {
    Config {
        staggered_boot_delay: Duration::from_millis(50),
        reconnect_jitter: (Duration::from_millis(5), Duration::from_millis(20)),
        key_write_debounce: Duration::from_millis(20),
        ..Config::default()
    }
}

fn fleet_with(config: Config) -> Fleet {
    let registry = MemoryRegistry::new();
    let sessions = MemorySessionRepo::new();
    let store = Arc::new(SessionStore::new(
        sessions.clone(),
        config.key_write_debounce,
    ));
    let protocol = Arc::new(MemoryProtocol::new());
    let coordinator = FleetCoordinator::new(config, registry.clone(), store, protocol.clone());
    Fleet {
        coordinator,
        registry,
        sessions,
        protocol,
    }
}

fn user(n: u32) -> Uuid {
    Uuid::from_u128(u128::from(n) + 1)
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn row(fleet: &Fleet, id: Uuid) -> InstanceRecord {
    fleet.registry.get(id).await.expect("instance row")
}

#[tokio::test]
async fn create_pairs_and_connects() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    let record = fleet
        .coordinator
        .create_instance(user(1), "vendas-01".into(), HOOK.into())
        .await
        .unwrap();
    let id = record.id;
    assert_eq!(record.connection_status, ConnectionStatus::Connecting);
    assert_eq!(record.instance_name, "vendas-01");

    wait_until("socket to open", move || async move {
        f.protocol.has_link("vendas-01")
    })
    .await;

    assert!(
        fleet
            .protocol
            .emit(
                "vendas-01",
                WaEvent::Qr {
                    code: "2@pairing-challenge-payload".into(),
                },
            )
            .await
    );
    wait_until("qr to reach the row", move || async move {
        let r = row(f, id).await;
        r.connection_status == ConnectionStatus::QrPending
            && r.qr_code.is_some()
            && r.qr_code_expires_at.is_some()
    })
    .await;

    let qr = fleet.coordinator.get_qr(id).await.unwrap();
    assert!(qr.qr_code.unwrap().starts_with("data:image/png;base64,"));
    assert_eq!(qr.connection_status, ConnectionStatus::QrPending);

    fleet
        .protocol
        .emit(
            "vendas-01",
            WaEvent::Open {
                user_id: "5511999000111:7@s.whatsapp.net".into(),
            },
        )
        .await;
    wait_until("row to show connected", move || async move {
        let r = row(f, id).await;
        r.is_connected
            && r.connection_status == ConnectionStatus::Connected
            && r.qr_code.is_none()
            && r.qr_code_expires_at.is_none()
            && r.owner_phone_number.as_deref() == Some("5511999000111")
            && r.last_connected_at.is_some()
    })
    .await;

    let qr = fleet.coordinator.get_qr(id).await.unwrap();
    assert_eq!(qr.qr_code, None);
}

#[tokio::test]
async fn name_and_owner_conflicts_are_rejected() {
    let fleet = fleet_with(fast_config());
    fleet
        .coordinator
        .create_instance(user(1), "dup-01".into(), HOOK.into())
        .await
        .unwrap();

    let err = fleet
        .coordinator
        .create_instance(user(2), "dup-01".into(), HOOK.into())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NameTaken(_)));

    let err = fleet
        .coordinator
        .create_instance(user(1), "dup-02".into(), HOOK.into())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::OwnerTaken));

    // rejected creates must release their reserved fleet slot
    assert_eq!(fleet.coordinator.stats().sockets, 1);
}

#[tokio::test]
async fn capacity_is_a_hard_ceiling() {
    let config = Config {
        max_instances: 3,
        ..fast_config()
    };
    let fleet = fleet_with(config);
    for i in 0..3 {
        fleet
            .coordinator
            .create_instance(user(i), format!("cap-{i}"), HOOK.into())
            .await
            .unwrap();
    }

    let err = fleet
        .coordinator
        .create_instance(user(99), "cap-overflow".into(), HOOK.into())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::CapacityExceeded { limit: 3 }));

    // the incumbents are untouched
    assert_eq!(fleet.coordinator.stats().sockets, 3);
    assert_eq!(fleet.coordinator.list_instances().await.unwrap().len(), 3);
}

#[tokio::test]
async fn logout_wipes_the_session() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    let record = fleet
        .coordinator
        .create_instance(user(1), "bye-01".into(), HOOK.into())
        .await
        .unwrap();
    let id = record.id;

    wait_until("socket to open", move || async move {
        f.protocol.has_link("bye-01")
    })
    .await;
    fleet
        .protocol
        .emit(
            "bye-01",
            WaEvent::Open {
                user_id: "5511988000222:3@s.whatsapp.net".into(),
            },
        )
        .await;
    fleet.protocol.emit("bye-01", WaEvent::CredsUpdate).await;
    wait_until("session row to be persisted", move || async move {
        f.sessions.exists("bye-01").await.unwrap()
    })
    .await;

    fleet
        .protocol
        .emit(
            "bye-01",
            WaEvent::Close {
                reason: DisconnectReason::LoggedOut,
            },
        )
        .await;
    wait_until("row to be wiped", move || async move {
        let r = row(f, id).await;
        r.connection_status == ConnectionStatus::Disconnected
            && !r.is_connected
            && r.qr_code.is_none()
            && r.owner_phone_number.is_none()
    })
    .await;
    wait_until("session row to be deleted", move || async move {
        !f.sessions.exists("bye-01").await.unwrap()
    })
    .await;

    // a logged-out instance must not be reconnected
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fleet.protocol.connect_attempts("bye-01"), 1);
}

#[tokio::test]
async fn reconnect_storm_is_bounded_by_the_semaphore() {
    let config = Config {
        max_instances: 80,
        reconnect_jitter: (Duration::from_millis(10), Duration::from_millis(30)),
        ..fast_config()
    };
    let fleet = fleet_with(config);
    let f = &fleet;
    let name = |i: u32| format!("herd-{i:02}");

    for i in 0..80 {
        fleet
            .coordinator
            .create_instance(user(i), name(i), HOOK.into())
            .await
            .unwrap();
    }
    wait_until("all 80 sockets to open", move || async move {
        (0..80).all(|i| f.protocol.connect_attempts(&format!("herd-{i:02}")) >= 1)
    })
    .await;

    let stop = Arc::new(AtomicBool::new(false));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let monitor = {
        let coordinator = fleet.coordinator.clone();
        let stop = Arc::clone(&stop);
        let max_seen = Arc::clone(&max_seen);
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let active = coordinator.stats().active_reconnections;
                max_seen.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let storm_start = Instant::now();
    for i in 0..80 {
        fleet
            .protocol
            .emit(
                &name(i),
                WaEvent::Close {
                    reason: DisconnectReason::ConnectionLost,
                },
            )
            .await;
    }

    wait_until("all 80 instances to reconnect", move || async move {
        (0..80).all(|i| f.protocol.connect_attempts(&format!("herd-{i:02}")) >= 2)
    })
    .await;
    stop.store(true, Ordering::SeqCst);
    monitor.await.unwrap();

    assert!(
        max_seen.load(Ordering::SeqCst) <= 5,
        "more than 5 concurrent reconnections observed"
    );
    // 80 instances through 5 slots with >= 10 ms jitter each cannot finish
    // instantly; anything faster means the admission path was bypassed
    assert!(storm_start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn retry_cap_parks_the_instance_as_failed() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    fleet.protocol.fail_connects(true);

    let record = fleet
        .coordinator
        .create_instance(user(1), "flappy-01".into(), HOOK.into())
        .await
        .unwrap();
    let id = record.id;

    wait_until("instance to be marked failed", move || async move {
        row(f, id).await.connection_status == ConnectionStatus::Failed
    })
    .await;

    // one initial connect plus the five admitted retries
    assert_eq!(fleet.protocol.connect_attempts("flappy-01"), 6);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        fleet.protocol.connect_attempts("flappy-01"),
        6,
        "failed instance must not be retried further"
    );
}

#[tokio::test]
async fn boot_recovery_staggers_batches() {
    let fleet = fleet_with(fast_config());
    let base = chrono::Utc::now();

    // 12 recoverable rows with increasing connection ages, plus rows that
    // must be left alone
    let mut expected: Vec<String> = Vec::new();
    for i in 0..12u32 {
        let name = format!("boot-{i:02}");
        let mut record = InstanceRecord::new(user(i), name.clone(), HOOK.into());
        record.connection_status = ConnectionStatus::Connected;
        record.is_connected = true;
        record.last_connected_at = Some(base + chrono::Duration::seconds(i64::from(i)));
        fleet.registry.insert(record).await.unwrap();
        expected.push(name);
    }
    for (i, status) in [
        (100u32, ConnectionStatus::Disconnected),
        (101, ConnectionStatus::Failed),
    ] {
        let mut record = InstanceRecord::new(user(i), format!("idle-{i}"), HOOK.into());
        record.connection_status = status;
        fleet.registry.insert(record).await.unwrap();
    }

    fleet.coordinator.recover().await.unwrap();

    let mut log = fleet.protocol.attempt_log();
    assert_eq!(log.len(), 12, "only recoverable rows get a connect");
    log.sort_by_key(|(_, at)| *at);

    // batches of 5: oldest connections first, sets compared because order
    // within a parallel batch is arbitrary
    let batches: Vec<HashSet<&str>> = log
        .chunks(5)
        .map(|c| c.iter().map(|(n, _)| n.as_str()).collect())
        .collect();
    let want: Vec<HashSet<&str>> = expected
        .chunks(5)
        .map(|c| c.iter().map(String::as_str).collect())
        .collect();
    assert_eq!(batches, want);

    // non-final batches are separated by at least the boot delay
    let gap = Duration::from_millis(25);
    assert!(log[5].1.duration_since(log[4].1) >= gap);
    assert!(log[10].1.duration_since(log[9].1) >= gap);
}

#[tokio::test]
async fn delete_is_idempotent_and_stops_the_socket() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    let record = fleet
        .coordinator
        .create_instance(user(1), "gone-01".into(), HOOK.into())
        .await
        .unwrap();

    wait_until("socket to open", move || async move {
        f.protocol.has_link("gone-01")
    })
    .await;
    fleet.protocol.emit("gone-01", WaEvent::CredsUpdate).await;
    wait_until("session row to exist", move || async move {
        f.sessions.exists("gone-01").await.unwrap()
    })
    .await;

    fleet.coordinator.delete_instance(record.id).await.unwrap();
    assert_eq!(fleet.coordinator.stats().sockets, 0);
    assert!(!fleet.sessions.exists("gone-01").await.unwrap());
    assert!(!fleet.protocol.has_link("gone-01"));
    assert!(matches!(
        fleet.coordinator.get_instance(record.id).await,
        Err(FleetError::NotFound)
    ));

    let err = fleet
        .coordinator
        .delete_instance(record.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound));
}

#[tokio::test]
async fn restart_reuses_the_session_and_reconnects() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    let record = fleet
        .coordinator
        .create_instance(user(1), "again-01".into(), HOOK.into())
        .await
        .unwrap();

    wait_until("socket to open", move || async move {
        f.protocol.has_link("again-01")
    })
    .await;
    fleet.protocol.emit("again-01", WaEvent::CredsUpdate).await;
    wait_until("session row to exist", move || async move {
        f.sessions.exists("again-01").await.unwrap()
    })
    .await;

    fleet.coordinator.restart_instance(record.id).await.unwrap();
    wait_until("second connect attempt", move || async move {
        f.protocol.connect_attempts("again-01") >= 2
    })
    .await;
    // restart keeps the session blob
    assert!(fleet.sessions.exists("again-01").await.unwrap());

    assert!(matches!(
        fleet.coordinator.restart_instance(Uuid::new_v4()).await,
        Err(FleetError::NotFound)
    ));
}

#[tokio::test]
async fn shutdown_closes_sockets_and_swallows_late_events() {
    let fleet = fleet_with(fast_config());
    let f = &fleet;
    fleet
        .coordinator
        .create_instance(user(1), "park-01".into(), HOOK.into())
        .await
        .unwrap();
    wait_until("socket to open", move || async move {
        f.protocol.has_link("park-01")
    })
    .await;

    fleet.coordinator.shutdown().await;

    // the socket is gone and the close was expected: no reconnect happens
    assert!(!fleet.protocol.has_link("park-01"));
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(fleet.protocol.connect_attempts("park-01"), 1);
}
