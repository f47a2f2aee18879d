// src/bin/handoff_demo.rs - Export a shared USM array and hand it to a consumer
//
// With the `shared-library` feature and USM_DLPACK_CONSUMER_LIBRARY set, the
// capsule goes to that library's Give/Finalize. Otherwise a threaded
// in-process consumer stands in for it.

use std::sync::Arc;

use usm_dlpack_handoff::handoff::Consumer;
use usm_dlpack_handoff::*;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("❌ Handoff failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = HandoffConfig::from_env()?;
    let runtime = Arc::new(HostRuntime::with_devices(DeviceRegistry::host(), &config));

    let array = UsmNdArray::empty(runtime.clone(), Device::cpu(0), &[3, 1, 30], "f4", AllocKind::Shared)?;
    let values: Vec<u8> = (0..array.size())
        .flat_map(|i| ((i as f32) / array.size() as f32).to_ne_bytes())
        .collect();
    array.copy_from_host(&values)?;
    println!("Created: {}", array);

    let consumer = open_consumer(&config)?;

    let capsule = export(&array)?;
    println!("Exporting: {}", capsule.view());
    println!("-------------------------");

    // The capsule's pin is all that keeps the storage alive from here on.
    drop(array);
    let receipt = give(capsule, consumer.as_ref());
    println!("Given: {:?}", receipt);
    println!("-------------------------");

    finalize(consumer.as_ref());
    println!("After finalize: {:?}", receipt);
    println!("Runtime: {:?}", runtime.stats());
    println!("Outstanding capsules: {}", outstanding_capsules());
    println!("-------------------------");
    Ok(())
}

#[cfg(feature = "shared-library")]
fn open_consumer(config: &HandoffConfig) -> Result<Box<dyn Consumer>> {
    if config.consumer_library.is_some() {
        return Ok(Box::new(SharedLibraryConsumer::open(config)?));
    }
    Ok(Box::new(ThreadedConsumer::spawn()))
}

#[cfg(not(feature = "shared-library"))]
fn open_consumer(config: &HandoffConfig) -> Result<Box<dyn Consumer>> {
    if let Some(path) = &config.consumer_library {
        log::warn!(
            "Ignoring consumer library {:?}: built without the shared-library feature",
            path
        );
    }
    Ok(Box::new(ThreadedConsumer::spawn()))
}
