//! CUDA driver tests.
//!
//! Run with: cargo test -p memspace-cuda --features cuda -- --ignored

#![cfg(feature = "cuda")]

use std::process::Command;
use std::sync::Arc;

use memspace_core::prelude::*;
use memspace_cuda::{is_cuda_available, CudaDriver};

macro_rules! skip_without_cuda {
    () => {
        if !is_cuda_available() {
            println!("CUDA not available, skipping test");
            return;
        }
    };
}

/// Set in the child process spawned by `test_ipc_export_import_across_processes`.
const IPC_HANDLE_VAR: &str = "MEMSPACE_TEST_IPC_HANDLE";

fn worker() -> (Arc<DeviceRegistry>, DataMover) {
    let (_, registry, mover) = worker_with_driver();
    (registry, mover)
}

fn worker_with_driver() -> (Arc<CudaDriver>, Arc<DeviceRegistry>, DataMover) {
    let cuda = Arc::new(CudaDriver::new().expect("Failed to init CUDA"));
    let driver: Arc<dyn DeviceDriver> = cuda.clone();
    let registry = DeviceRegistry::with_driver(WorkerId(0), driver, &RegistryConfig::default())
        .expect("Failed to build registry");
    let fabric = Arc::new(Standalone::new(WorkerId(0), NodeId::local()).with_registry(registry.clone()));
    let mover = DataMover::new(registry.clone(), fabric, TransferConfig::default());
    (cuda, registry, mover)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(text: &str) -> Vec<u8> {
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
        .collect()
}

#[test]
#[ignore] // Requires CUDA GPU
fn test_registry_discovers_devices() {
    skip_without_cuda!();

    let (registry, _) = worker();
    assert!(!registry.is_empty());
    for device in registry.devices() {
        println!("{} {} {}", device.processor(), device.name, device.uuid);
    }
}

#[test]
#[ignore] // Requires CUDA GPU
fn test_upload_download_round_trip() {
    skip_without_cuda!();

    let (registry, mover) = worker();
    let space = registry.memory_spaces()[0];
    let host = HostArray::from_vec((0..1024).map(|i| i as f32).collect::<Vec<_>>());

    let device = mover.upload(&space, &host).expect("upload");
    let back = mover.download(&device).expect("download");
    assert_eq!(back.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
}

#[test]
#[ignore] // Requires CUDA GPU
fn test_native_fills() {
    skip_without_cuda!();

    let (registry, mover) = worker();
    let space = registry.memory_spaces()[0];

    let ones = mover.allocate(&space, DType::F64, &[8], AllocIntent::Ones).unwrap();
    assert_eq!(mover.download(&ones).unwrap().to_vec::<f64>().unwrap(), vec![1.0; 8]);

    let ones = mover.allocate(&space, DType::I64, &[5], AllocIntent::Ones).unwrap();
    assert_eq!(mover.download(&ones).unwrap().to_vec::<i64>().unwrap(), vec![1; 5]);

    let ones = mover.allocate(&space, DType::I32, &[7], AllocIntent::Ones).unwrap();
    assert_eq!(mover.download(&ones).unwrap().to_vec::<i32>().unwrap(), vec![1; 7]);

    let ones = mover.allocate(&space, DType::U8, &[3], AllocIntent::Ones).unwrap();
    assert_eq!(mover.download(&ones).unwrap().to_vec::<u8>().unwrap(), vec![1; 3]);

    let zeros = mover.allocate(&space, DType::F32, &[64], AllocIntent::Zeros).unwrap();
    assert_eq!(mover.download(&zeros).unwrap().to_vec::<f32>().unwrap(), vec![0.0; 64]);

    let random = mover
        .allocate(&space, DType::F32, &[256], AllocIntent::Random { seed: 3 })
        .unwrap();
    let values = mover.download(&random).unwrap().to_vec::<f32>().unwrap();
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(values.windows(2).any(|w| w[0] != w[1]));

    let again = mover
        .allocate(&space, DType::F32, &[256], AllocIntent::Random { seed: 3 })
        .unwrap();
    assert_eq!(mover.download(&again).unwrap().to_vec::<f32>().unwrap(), values);

    let random = mover
        .allocate(&space, DType::F64, &[128], AllocIntent::Random { seed: 4 })
        .unwrap();
    let values = mover.download(&random).unwrap().to_vec::<f64>().unwrap();
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
#[ignore] // Requires CUDA GPU
fn test_release_on_unbound_thread() {
    skip_without_cuda!();

    let (cuda, registry, mover) = worker_with_driver();
    let space = registry.memory_spaces()[0];
    let array = mover
        .upload(&space, &HostArray::from_vec(vec![2.0f32; 512]))
        .unwrap();
    let live = cuda.live_allocations();

    // The spawned thread never activates a device.
    std::thread::spawn(move || drop(array)).join().unwrap();
    assert_eq!(cuda.live_allocations(), live - 1);
}

#[test]
#[ignore] // Requires CUDA GPU
fn test_ipc_export_import_across_processes() {
    skip_without_cuda!();

    let cuda = CudaDriver::new().unwrap();
    let context = cuda.create_context(DeviceId(0)).unwrap();
    let stream = cuda.create_stream(context).unwrap();
    cuda.set_current(Some(context)).unwrap();

    let fill = NativeFill::Pattern(7u32.to_ne_bytes().to_vec());
    let allocation = cuda.alloc(stream, 16, fill).unwrap();
    cuda.synchronize_stream(stream).unwrap();
    let handle = cuda.ipc_export(allocation).unwrap();

    // CUDA refuses to open a handle in the process that exported it.
    let status = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_ipc_import_in_child", "--ignored", "--nocapture"])
        .env(IPC_HANDLE_VAR, to_hex(&handle.bytes))
        .status()
        .expect("Failed to spawn importer");
    assert!(status.success());

    let mut back = [0u8; 16];
    cuda.copy_dtoh(stream, allocation, &mut back).unwrap();
    let words: Vec<u32> = back
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    assert_eq!(words, vec![9; 4]);

    cuda.free(allocation).unwrap();
    cuda.set_current(None).unwrap();
}

/// Importer half of `test_ipc_export_import_across_processes`.
#[test]
#[ignore] // Requires CUDA GPU
fn test_ipc_import_in_child() {
    let Ok(encoded) = std::env::var(IPC_HANDLE_VAR) else {
        return;
    };

    let cuda = CudaDriver::new().unwrap();
    let context = cuda.create_context(DeviceId(0)).unwrap();
    let stream = cuda.create_stream(context).unwrap();
    cuda.set_current(Some(context)).unwrap();

    let handle = IpcMemHandle {
        backend: Backend::Cuda,
        bytes: from_hex(&encoded),
    };
    let alias = cuda.ipc_import(context, &handle).unwrap();

    let mut seen = [0u8; 16];
    cuda.copy_dtoh(stream, alias, &mut seen).unwrap();
    assert_eq!(&seen[..4], &7u32.to_ne_bytes());

    let update: Vec<u8> = std::iter::repeat(9u32.to_ne_bytes()).take(4).flatten().collect();
    cuda.copy_htod(stream, &update, alias).unwrap();
    cuda.synchronize_stream(stream).unwrap();

    cuda.ipc_close(alias).unwrap();
    assert_eq!(cuda.live_allocations(), 0);
    cuda.set_current(None).unwrap();
}

#[test]
#[ignore] // Requires at least two CUDA GPUs
fn test_cross_device_move() {
    skip_without_cuda!();

    let (registry, mover) = worker();
    let spaces = registry.memory_spaces();
    if spaces.len() < 2 {
        println!("Fewer than two GPUs, skipping test");
        return;
    }

    let host = HostArray::from_vec(vec![3i32; 4096]);
    let on_first = Value::Device(mover.upload(&spaces[0], &host).unwrap());
    let moved = mover
        .move_value(&spaces[0].into(), &spaces[1].into(), &on_first)
        .unwrap();
    let moved = moved.into_device().unwrap();
    assert_eq!(moved.space(), spaces[1]);
    assert_eq!(mover.download(&moved).unwrap().to_vec::<i32>().unwrap(), vec![3; 4096]);
}
