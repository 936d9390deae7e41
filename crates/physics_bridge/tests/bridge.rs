//! End-to-end scenarios driving the full stack: facade, director,
//! dispatcher, backend, engine.

use std::time::{Duration, Instant};

use glam::Vec3;
use physics_bridge::{BridgeSettings, CreateBody, PhysicsBridge};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn settings() -> BridgeSettings {
    BridgeSettings {
        fixed_step: 1.0 / 30.0,
        ..BridgeSettings::default()
    }
}

/// Pumps until the outstanding step has been answered.
fn settle(bridge: &mut PhysicsBridge) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.in_flight() {
        bridge.pump().unwrap();
        if Instant::now() > deadline {
            panic!("bridge did not settle within the deadline");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn drop_scenario(mut bridge: PhysicsBridge) {
    bridge.set_gravity(Vec3::new(0.0, -9.81, 0.0)).unwrap();
    bridge
        .create_body(CreateBody::dynamic(0, Vec3::new(0.0, 10.0, 0.0)))
        .unwrap();
    bridge.manual_step(0).unwrap();
    settle(&mut bridge);

    bridge.manual_step(30).unwrap();
    settle(&mut bridge);
    assert_eq!(bridge.last_steps(), 30);

    let pose = bridge.body_pose(0).expect("pose reported");
    assert!(pose.position.y < 10.0, "body did not fall: {}", pose.position.y);
    assert!(pose.linear_velocity.y < 0.0);
    assert!((pose.linear_velocity.y + 9.81).abs() < 0.05);

    bridge.destroy().unwrap();
}

#[test]
fn test_gravity_drop_direct_transfer() {
    init_tracing();
    drop_scenario(PhysicsBridge::new(settings()).unwrap());
}

#[test]
fn test_gravity_drop_shared_memory() {
    init_tracing();
    let settings = BridgeSettings {
        use_shared_memory: true,
        ..settings()
    };
    drop_scenario(PhysicsBridge::new(settings).unwrap());
}

#[test]
fn test_gravity_drop_worker_context() {
    init_tracing();
    let settings = BridgeSettings {
        use_worker_context: true,
        ..settings()
    };
    drop_scenario(PhysicsBridge::new(settings).unwrap());
}

#[test]
fn test_gravity_drop_worker_shared_memory() {
    init_tracing();
    let settings = BridgeSettings {
        use_worker_context: true,
        use_shared_memory: true,
        ..settings()
    };
    drop_scenario(PhysicsBridge::new(settings).unwrap());
}

#[test]
fn test_raycast_round_trip() {
    init_tracing();
    let mut bridge = PhysicsBridge::new(settings()).unwrap();
    bridge
        .create_body(CreateBody::dynamic(0, Vec3::new(0.0, 0.0, 3.0)))
        .unwrap();
    let ray = bridge
        .raycast(Vec3::ZERO, Vec3::new(0.0, 0.0, 10.0))
        .unwrap();
    bridge.manual_step(0).unwrap();
    settle(&mut bridge);

    let replies = bridge.take_raycast_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].ray, ray);
    let hit = replies[0].hit.expect("ray hits the body");
    assert_eq!(hit.body, 0);
    assert!(bridge.take_raycast_replies().is_empty());
}

#[test]
fn test_impulse_changes_reported_velocity() {
    init_tracing();
    let mut bridge = PhysicsBridge::new(settings()).unwrap();
    bridge.set_gravity(Vec3::ZERO).unwrap();
    bridge
        .create_body(CreateBody {
            mass: Some(2.0),
            ..CreateBody::dynamic(1, Vec3::ZERO)
        })
        .unwrap();
    bridge
        .apply_impulse(1, Vec3::new(4.0, 0.0, 0.0), None)
        .unwrap();
    bridge.manual_step(1).unwrap();
    settle(&mut bridge);

    let pose = bridge.body_pose(1).unwrap();
    // 4 N·s into 2 kg.
    assert!((pose.linear_velocity.x - 2.0).abs() < 1e-5);
}

#[test]
fn test_destroyed_body_disappears_from_mirror() {
    init_tracing();
    let mut bridge = PhysicsBridge::new(settings()).unwrap();
    bridge.create_body(CreateBody::dynamic(0, Vec3::Y)).unwrap();
    bridge.create_body(CreateBody::dynamic(1, Vec3::X)).unwrap();
    bridge.manual_step(1).unwrap();
    settle(&mut bridge);
    assert_eq!(bridge.mirrored_bodies(), 2);

    bridge.destroy_body(0).unwrap();
    bridge.manual_step(1).unwrap();
    settle(&mut bridge);
    assert!(bridge.body_pose(0).is_none());
    assert!(bridge.body_pose(1).is_some());
}

#[test]
fn test_interpolate_does_not_advance_simulation() {
    init_tracing();
    let mut bridge = PhysicsBridge::new(settings()).unwrap();
    bridge
        .create_body(CreateBody::dynamic(0, Vec3::new(0.0, 10.0, 0.0)))
        .unwrap();
    bridge.manual_step(5).unwrap();
    settle(&mut bridge);
    let before = bridge.body_pose(0).unwrap();

    bridge.interpolate().unwrap();
    settle(&mut bridge);
    let after = bridge.body_pose(0).unwrap();

    // No simulation time passed between the two reports.
    assert!(before.position.abs_diff_eq(after.position, 1e-6));
}

#[test]
fn test_destroy_is_idempotent_and_terminal() {
    init_tracing();
    let mut bridge = PhysicsBridge::new(settings()).unwrap();
    bridge.create_body(CreateBody::dynamic(0, Vec3::Y)).unwrap();
    bridge.manual_step(1).unwrap();
    settle(&mut bridge);

    bridge.destroy().unwrap();
    bridge.destroy().unwrap();
    assert!(bridge.is_destroyed());
    assert!(bridge.step(0.016).is_err());
    assert!(bridge.create_body(CreateBody::dynamic(1, Vec3::ZERO)).is_err());
}

#[test]
fn test_worker_destroy_joins_cleanly() {
    init_tracing();
    let settings = BridgeSettings {
        use_worker_context: true,
        ..settings()
    };
    let mut bridge = PhysicsBridge::new(settings).unwrap();
    bridge.create_body(CreateBody::dynamic(0, Vec3::Y)).unwrap();
    bridge.manual_step(1).unwrap();
    settle(&mut bridge);
    bridge.destroy().unwrap();
    // Dropping the bridge joins the worker thread.
    drop(bridge);
}
