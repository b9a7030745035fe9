//! Diagnostics command - checks Docker connectivity and prints the
//! configuration the engine would start with.

use anyhow::Result;
use bollard::Docker;

use update_engine::config::Configuration;

/// Prints configuration and Docker daemon connectivity information.
pub async fn run(config_path: &str) -> Result<()> {
    println!("Update Engine Diagnostics");
    println!("=========================\n");

    let config = Configuration::load(config_path).unwrap_or_else(|e| {
        println!("  (using defaults: {})", e);
        Configuration::default()
    });

    println!("Configuration:");
    println!("--------------");
    println!("  engine_id: {}", config.engine_id);
    println!("  database_path: {}", config.database_path);
    println!("  watch_interval_sec: {}", config.watch_interval_sec);
    println!("  registry_concurrency: {}", config.registry_concurrency);
    println!("  executor_workers: {}", config.executor_workers);
    println!("  digest_cache_ttl_sec: {}", config.digest_cache_ttl_sec);
    println!("  shutdown_grace_sec: {}", config.shutdown_grace_sec);
    println!("  log.level: {}", config.log.level);

    println!("\nDocker Daemon:");
    println!("--------------");
    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.version().await {
            Ok(version) => {
                println!("  Version: {}", version.version.unwrap_or_default());
                println!("  API Version: {}", version.api_version.unwrap_or_default());
                println!(
                    "  OS/Arch: {}/{}",
                    version.os.unwrap_or_default(),
                    version.arch.unwrap_or_default()
                );
                match docker.info().await {
                    Ok(info) => {
                        println!("  Containers: {}", info.containers.unwrap_or(0));
                        println!("    Running: {}", info.containers_running.unwrap_or(0));
                        println!("    Stopped: {}", info.containers_stopped.unwrap_or(0));
                    }
                    Err(e) => println!("  Error getting info: {}", e),
                }
            }
            Err(e) => println!("  Error getting version: {}", e),
        },
        Err(e) => {
            println!("  Error connecting to Docker: {}", e);
            println!("  Make sure Docker is running and accessible.");
        }
    }

    println!("\nDiagnostics complete.");
    Ok(())
}
