//! End-to-end transfer scenarios on an in-process cluster.

mod common;

use memspace::prelude::*;

use common::{driver_stats, init_tracing, read_back, upload};

/// Host array moved to device 0 reads back unchanged.
#[test]
fn test_host_to_device_read_back() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node = cluster.add_node("node-a", 1).expect("Failed to add node");
    let worker = cluster.spawn_worker(&node, &[0]).expect("Failed to spawn worker");
    let space = worker.memory_spaces()[0];

    let on_device = upload(&worker, space, vec![1.0f64, 2.0, 3.0]);
    assert_eq!(on_device.as_device().unwrap().space(), space);

    let back = worker
        .move_value(&space.into(), &worker.host(), &on_device)
        .expect("Failed to move to host");
    assert_eq!(back.as_host().unwrap().to_vec::<f64>().unwrap(), vec![1.0, 2.0, 3.0]);
}

/// Moving a buffer to its own descriptor returns the same allocation and
/// issues no copy.
#[test]
fn test_identity_move_issues_no_copy() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node = cluster.add_node("node-a", 1).unwrap();
    let worker = cluster.spawn_worker(&node, &[0]).unwrap();
    let space = worker.memory_spaces()[0];

    let value = upload(&worker, space, vec![5i32; 64]);
    let before = driver_stats(&cluster, &worker);

    let moved = worker
        .move_value(&space.into(), &space.into(), &value)
        .expect("Failed identity move");

    let after = driver_stats(&cluster, &worker);
    assert!(moved.is_same(&value));
    assert_eq!(after.copies(), before.copies());
    assert_eq!(after.allocations, before.allocations);
    assert_eq!(worker.mover().stats().affinity_corrections, 0);
}

/// Device 0 to device 1 on one worker: equal contents, distinct
/// allocation on device 1.
#[test]
fn test_cross_device_same_worker() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node = cluster.add_node("node-a", 2).unwrap();
    let worker = cluster.spawn_worker(&node, &[0, 1]).unwrap();
    let spaces = worker.memory_spaces();
    assert_ne!(spaces[0].uuid, spaces[1].uuid);

    let source = upload(&worker, spaces[0], vec![1.5f32, -2.5, 8.0]);
    let moved = worker
        .move_value(&spaces[0].into(), &spaces[1].into(), &source)
        .expect("Failed cross-device move");

    let array = moved.as_device().unwrap();
    assert_eq!(array.space(), spaces[1]);
    assert!(!moved.is_same(&source));
    assert_eq!(read_back::<f32>(&worker, &moved), vec![1.5, -2.5, 8.0]);
    assert_eq!(worker.mover().stats().cross_device, 1);
    assert_eq!(driver_stats(&cluster, &worker).events_recorded, 1);
}

/// Two workers on one node seeing the same device share memory: a write
/// through the importer's alias is visible from the owner.
#[test]
fn test_same_node_same_device_aliases() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node = cluster.add_node("node-a", 1).unwrap();
    let a = cluster.spawn_worker(&node, &[0]).unwrap();
    let b = cluster.spawn_worker(&node, &[0]).unwrap();
    let a_space = a.memory_spaces()[0];
    let b_space = b.memory_spaces()[0];
    assert_eq!(a_space.uuid, b_space.uuid);

    let source = upload(&a, a_space, vec![1u32, 2, 3, 4]);
    let moved = b
        .move_value(&a_space.into(), &b_space.into(), &source)
        .expect("Failed shared-memory move");
    let mut alias = moved.into_device().unwrap();
    assert!(alias.is_alias());
    assert_eq!(alias.space(), b_space);

    let update = Value::Host(HostArray::from_vec(vec![9u32, 8, 7, 6]));
    b.mover()
        .move_into(&b_space.into(), &b.host(), &mut alias, &update)
        .expect("Failed to write through alias");

    // Re-read from the owner without another move.
    assert_eq!(read_back::<u32>(&a, &source), vec![9, 8, 7, 6]);
    assert_eq!(driver_stats(&cluster, &a).ipc_exports, 1);
    assert_eq!(driver_stats(&cluster, &b).ipc_imports, 1);

    drop(alias);
    assert_eq!(driver_stats(&cluster, &b).ipc_closes, 1);
}

/// Workers on different nodes: equal contents, host round trip, no IPC,
/// and the destination is a private copy.
#[test]
fn test_cross_node_round_trip() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node_a = cluster.add_node("node-a", 1).unwrap();
    let node_c = cluster.add_node("node-c", 1).unwrap();
    let a = cluster.spawn_worker(&node_a, &[0]).unwrap();
    let c = cluster.spawn_worker(&node_c, &[0]).unwrap();
    let a_space = a.memory_spaces()[0];
    let c_space = c.memory_spaces()[0];

    let source = upload(&a, a_space, vec![10i64, 20, 30]);
    let moved = c
        .move_value(&a_space.into(), &c_space.into(), &source)
        .expect("Failed cross-node move");

    assert_eq!(moved.as_device().unwrap().space(), c_space);
    assert_eq!(read_back::<i64>(&c, &moved), vec![10, 20, 30]);
    assert_eq!(c.mover().stats().cross_node, 1);

    let (a_stats, c_stats) = (driver_stats(&cluster, &a), driver_stats(&cluster, &c));
    assert_eq!(a_stats.ipc_exports, 0);
    assert_eq!(c_stats.ipc_imports, 0);
    assert_eq!(a_stats.dtoh_copies, 1);

    let mut copy = moved.into_device().unwrap();
    assert!(!copy.is_alias());
    let update = Value::Host(HostArray::from_vec(vec![0i64; 3]));
    c.mover()
        .move_into(&c_space.into(), &c.host(), &mut copy, &update)
        .expect("Failed to overwrite destination");
    assert_eq!(read_back::<i64>(&c, &Value::Device(copy)), vec![0, 0, 0]);
    assert_eq!(read_back::<i64>(&a, &source), vec![10, 20, 30]);
}

/// A task that divides by zero fails the caller's wait with the panic
/// message, its location and a trace.
#[tokio::test]
async fn test_task_panic_reaches_caller() {
    init_tracing();
    let cluster = LocalCluster::new();
    let node = cluster.add_node("node-a", 1).unwrap();
    let worker = cluster.spawn_worker(&node, &[0]).unwrap();
    let processor = worker.processors()[0];

    let err = worker
        .execute(
            processor,
            (),
            |_ctx: &TaskContext<()>, divisor: i32| Ok::<_, BoxError>(100 / divisor),
            0,
        )
        .await
        .expect_err("Task should fail");

    let failure = err.as_task_failure().expect("Not a task failure");
    assert_eq!(failure.processor(), processor);
    assert!(failure.is_panic());
    assert!(failure.panic_message().unwrap().contains("divide by zero"));
    assert!(failure.location().unwrap().contains("scenarios.rs"));
    assert!(!failure.backtrace().to_string().is_empty());
    assert!(err.to_string().contains("divide by zero"));
}

#[derive(Debug, thiserror::Error)]
#[error("solver diverged after {0} iterations")]
struct Diverged(u32);

/// An error returned by a task keeps its concrete type.
#[test]
fn test_task_error_downcasts() {
    init_tracing();
    let worker = Worker::builder().backend(Backend::Cpu).build().unwrap();
    let processor = worker.processors()[1];

    let err = worker
        .execute_blocking(
            processor,
            17u32,
            |ctx: &TaskContext<u32>, ()| Err::<(), _>(Diverged(*ctx.state())),
            (),
        )
        .expect_err("Task should fail");

    let failure = err.as_task_failure().expect("Not a task failure");
    assert!(!failure.is_panic());
    assert_eq!(failure.downcast_ref::<Diverged>().unwrap().0, 17);
    assert!(err.to_string().contains("diverged after 17"));
}
