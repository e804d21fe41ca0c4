use std::time::{Duration, Instant};

use torswarm_client::{ControlAuth, ControlConnection, TorConfig, TorInstances};
use torswarm_core::circuit::CircuitHealth;
use torswarm_core::error::AppError;
use torswarm_core::pool::{CircuitPool, PoolConfig};
use torswarm_core::traits::{ControlSession, TorControl};

use crate::common::{FakeControlPort, TEST_PASSWORD};

fn pool_config() -> PoolConfig {
    PoolConfig {
        size: 1,
        renewal_attempts: 2,
        renewal_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn open_session_authenticates_and_maps_ports() {
    let fake = FakeControlPort::start().await;
    let tor = TorInstances::new(fake.tor_config());

    let mut session = tor.open_session(0).await.unwrap();
    assert_eq!(session.endpoint().port, 19050);
    assert_eq!(session.endpoint().proxy_url(), "socks5h://127.0.0.1:19050");
    assert!(session.circuit_usable().await.unwrap());

    session.close().await.unwrap();
    assert_eq!(
        fake.commands(),
        [
            format!("AUTHENTICATE \"{TEST_PASSWORD}\""),
            "GETINFO status/circuit-established".to_string(),
            "QUIT".to_string(),
        ]
    );
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let fake = FakeControlPort::start().await;
    let tor = TorInstances::new(TorConfig {
        control_password: Some("nope".into()),
        ..fake.tor_config()
    });

    let err = tor.open_session(0).await.err().unwrap();
    assert!(matches!(err, AppError::Control(_)));
    assert!(err.to_string().contains("515"));
}

#[tokio::test]
async fn unauthenticated_commands_fail() {
    let fake = FakeControlPort::start().await;
    let mut conn = ControlConnection::connect("127.0.0.1", fake.port).await.unwrap();

    assert!(conn.signal_newnym().await.is_err());
    conn.authenticate(&ControlAuth::Password(TEST_PASSWORD.into()))
        .await
        .unwrap();
    conn.signal_newnym().await.unwrap();
}

#[tokio::test]
async fn missing_control_port_fails_open() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let tor = TorInstances::new(TorConfig {
        control_port_offset: port,
        ..Default::default()
    });
    assert!(tor.open_session(0).await.is_err());
}

#[tokio::test]
async fn pool_renews_through_control_port() {
    let fake = FakeControlPort::start().await;
    let pool = CircuitPool::new(TorInstances::new(fake.tor_config()), pool_config());

    let mut handle = pool.acquire().await.unwrap();
    assert_eq!(handle.generation(), 1);

    let generation = pool.renew(&mut handle).await.unwrap();
    assert_eq!(generation, 2);
    assert_eq!(fake.count("SIGNAL NEWNYM"), 1);
    assert_eq!(handle.health(), CircuitHealth::Fresh);

    pool.release(handle);
    pool.shutdown().await;
    assert_eq!(fake.count("QUIT"), 1);
}

#[tokio::test]
async fn rejected_newnym_exhausts_circuit() {
    let fake = FakeControlPort::start().await;
    let pool = CircuitPool::new(TorInstances::new(fake.tor_config()), pool_config());
    let mut handle = pool.acquire().await.unwrap();

    fake.set_reject_newnym(true);
    let err = pool.renew(&mut handle).await.unwrap_err();
    assert!(matches!(err, AppError::CircuitExhausted { slot: 0, attempts: 2 }));
    assert_eq!(handle.health(), CircuitHealth::Exhausted);

    pool.release(handle);
    assert!(pool.is_exhausted());
}

#[tokio::test]
async fn unestablished_circuit_times_out() {
    let fake = FakeControlPort::start().await;
    let pool = CircuitPool::new(TorInstances::new(fake.tor_config()), pool_config());
    let mut handle = pool.acquire().await.unwrap();

    fake.set_circuit_established(false);
    assert!(pool.renew(&mut handle).await.is_err());
    assert_eq!(fake.count("SIGNAL NEWNYM"), 2);
    assert!(fake.count("GETINFO status/circuit-established") > 2);
}

#[tokio::test]
async fn renewal_waits_for_a_new_circuit() {
    let fake = FakeControlPort::start().await;
    let pool = CircuitPool::new(
        TorInstances::new(fake.tor_config()),
        PoolConfig {
            renewal_timeout: Duration::from_secs(2),
            ..pool_config()
        },
    );
    let mut handle = pool.acquire().await.unwrap();

    fake.set_build_on_newnym(false);
    let builder = {
        let state = std::sync::Arc::clone(&fake.state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            state.lock().unwrap().build_circuit();
        })
    };

    let started = Instant::now();
    let generation = pool.renew(&mut handle).await.unwrap();
    builder.await.unwrap();

    assert_eq!(generation, 2);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(fake.count("SIGNAL NEWNYM"), 1);
    assert!(fake.count("GETINFO circuit-status") > 2);
    pool.release(handle);
}

#[tokio::test]
async fn renewal_without_new_circuit_exhausts() {
    let fake = FakeControlPort::start().await;
    let pool = CircuitPool::new(TorInstances::new(fake.tor_config()), pool_config());
    let mut handle = pool.acquire().await.unwrap();

    fake.set_build_on_newnym(false);
    let err = pool.renew(&mut handle).await.unwrap_err();
    assert!(matches!(err, AppError::CircuitExhausted { slot: 0, attempts: 2 }));

    assert_eq!(fake.count("SIGNAL NEWNYM"), 2);

    pool.release(handle);
    assert!(pool.is_exhausted());
}

#[tokio::test]
async fn back_to_back_newnym_respects_rate_limit() {
    let fake = FakeControlPort::start().await;
    let tor = TorInstances::new(TorConfig {
        newnym_interval: Duration::from_millis(300),
        ..fake.tor_config()
    });
    let mut session = tor.open_session(0).await.unwrap();

    let started = Instant::now();
    session.new_circuit().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    session.new_circuit().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(fake.count("SIGNAL NEWNYM"), 2);
    session.close().await.unwrap();
}
