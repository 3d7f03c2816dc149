//! `vm create/run/debug/start/stop/list/inspect/console/rm`.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::Args;
use cocoon_core::config::{parse_size, Config};
use cocoon_core::error::join_errors;
use cocoon_core::model::{new_vm_id, VmConfig};
use cocoon_hypervisor::{CreateRequest, HypervisorBackend};
use cocoon_net::NetworkBackend;

use crate::{console, image, OutputFormat, VmAction};

/// Flags shared by `create`, `run`, and `debug` (spec §6 "Common VM flags").
#[derive(Args)]
pub struct VmFlags {
    /// VM name, must be unique. Defaults to a name derived from the image.
    #[arg(long)]
    name: Option<String>,
    /// Number of vCPUs.
    #[arg(long, default_value_t = 2)]
    cpu: u32,
    /// Memory size (`1G`, `512M`, ...).
    #[arg(long, default_value = "1G")]
    memory: String,
    /// Root/COW disk size (`10G`, ...).
    #[arg(long, default_value = "10G")]
    storage: String,
    /// Number of NICs. `0` disables networking.
    #[arg(long, default_value_t = 1)]
    nics: u32,
}

fn network_backend(config: &Config) -> NetworkBackend {
    NetworkBackend::open(config.cni_dir(), config.cni_dir().join("networks.lock"), config.cni_conf_dir.clone(), config.cni_bin_dir.clone())
}

fn hypervisor_backend(config: &Config) -> HypervisorBackend {
    HypervisorBackend::open(config.clone())
}

pub async fn dispatch(config: &Config, action: VmAction) -> Result<()> {
    match action {
        VmAction::Create { flags, image } => {
            let vm = create(config, flags, &image).await?;
            println!("{}", vm.id);
            Ok(())
        }
        VmAction::Run { flags, image } => run(config, flags, &image, true).await,
        VmAction::Debug { flags, image } => run(config, flags, &image, false).await,
        VmAction::Start { refs } => start(config, &refs).await,
        VmAction::Stop { refs } => stop(config, &refs).await,
        VmAction::List { format } => list(config, format).await,
        VmAction::Inspect { r#ref } => inspect(config, &r#ref).await,
        VmAction::Console { r#ref, escape_char } => console_cmd(config, &r#ref, &escape_char).await,
        VmAction::Rm { force, refs } => rm(config, force, &refs).await,
    }
}

/// Phase 0, CLI-side: resolves `image` to its storage/boot configs and the
/// set of blob ids it depends on, dispatching to whichever image backend
/// owns that ref shape (spec §9 "Polymorphism").
async fn resolve_image(config: &Config, image: &str) -> Result<(Vec<cocoon_core::model::StorageConfig>, cocoon_core::model::BootConfig, BTreeSet<String>)> {
    if image::is_cloudimg_ref(image) {
        let backend = image::open_cloudimg(config);
        let entry = backend.ensure(image, &|msg| eprintln!("{msg}")).await?;
        let (storage, boot) = backend.config(image).await?;
        let blob_ids = BTreeSet::from([entry.content_sum.trim_start_matches("sha256:").to_owned()]);
        Ok((storage, boot, blob_ids))
    } else {
        let backend = image::open_oci(config);
        let entry = backend.ensure(image, &|msg| eprintln!("{msg}")).await?;
        let (storage, boot) = backend.config(image).await?;
        let blob_ids = entry.layers.iter().cloned().collect();
        Ok((storage, boot, blob_ids))
    }
}

async fn create(config: &Config, flags: VmFlags, image: &str) -> Result<cocoon_core::model::Vm> {
    let id = new_vm_id();
    let name = flags.name.clone().unwrap_or_else(|| format!("vm-{id}"));
    let vm_config = VmConfig {
        name,
        cpu: flags.cpu,
        memory_bytes: parse_size(&flags.memory).context("--memory")?,
        storage_bytes: parse_size(&flags.storage).context("--storage")?,
        image: image.to_owned(),
    };

    let (image_storage_configs, boot_config, image_blob_ids) = resolve_image(config, image).await?;
    let network_configs = network_backend(config).config(&id, flags.nics, &vm_config).await?;

    let request = CreateRequest {
        id,
        vm_config,
        image_storage_configs,
        boot_config,
        network_configs,
        image_blob_ids,
        root_password: config.root_password.clone(),
        dns: config.dns.clone(),
    };
    Ok(hypervisor_backend(config).create(request).await?)
}

/// Shared by `run` and `debug`: create, start, attach to the console.
/// `remove_on_exit` tears the VM down again once the console detaches
/// (`run`); `debug` leaves it running for further inspection.
async fn run(config: &Config, flags: VmFlags, image: &str, remove_on_exit: bool) -> Result<()> {
    let vm = create(config, flags, image).await?;
    let backend = hypervisor_backend(config);
    backend.start(&vm.id).await?;

    let stream = backend.console(&vm.id).await?;
    let escape_byte = console::parse_escape_char("^]")?;
    console::attach(stream, escape_byte).await?;

    if remove_on_exit {
        backend.stop(&vm.id).await?;
        network_backend(config).delete(&[vm.id.clone()]).await?;
        backend.delete(&vm.id, true).await?;
    }
    Ok(())
}

async fn start(config: &Config, refs: &[String]) -> Result<()> {
    let backend = hypervisor_backend(config);
    let mut failures = Vec::new();
    for r#ref in refs {
        match backend.start(r#ref).await {
            Ok(vm) => println!("{}", vm.id),
            Err(error) => {
                tracing::warn!(%error, r#ref, "start failed");
                failures.push((r#ref.clone(), error));
            }
        }
    }
    join_errors(failures).map_or(Ok(()), Err)?;
    Ok(())
}

async fn stop(config: &Config, refs: &[String]) -> Result<()> {
    let backend = hypervisor_backend(config);
    let mut failures = Vec::new();
    for r#ref in refs {
        match backend.stop(r#ref).await {
            Ok(vm) => println!("{}", vm.id),
            Err(error) => {
                tracing::warn!(%error, r#ref, "stop failed");
                failures.push((r#ref.clone(), error));
            }
        }
    }
    join_errors(failures).map_or(Ok(()), Err)?;
    Ok(())
}

async fn list(config: &Config, format: OutputFormat) -> Result<()> {
    let vms = hypervisor_backend(config).list().await?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&vms)?);
        return Ok(());
    }

    if vms.is_empty() {
        println!("No VMs.");
        return Ok(());
    }
    println!("{:<18} {:<20} {:<10} {}", "ID", "NAME", "STATE", "IMAGE");
    for vm in &vms {
        println!("{:<18} {:<20} {:<10} {}", vm.id, vm.config.name, format!("{:?}", vm.state), vm.config.image);
    }
    Ok(())
}

async fn inspect(config: &Config, r#ref: &str) -> Result<()> {
    let vm = hypervisor_backend(config).inspect(r#ref).await?;
    println!("{}", serde_json::to_string_pretty(&vm)?);
    Ok(())
}

async fn console_cmd(config: &Config, r#ref: &str, escape_char: &str) -> Result<()> {
    let backend = hypervisor_backend(config);
    let stream = backend.console(r#ref).await?;
    let escape_byte = console::parse_escape_char(escape_char)?;
    console::attach(stream, escape_byte).await
}

async fn rm(config: &Config, force: bool, refs: &[String]) -> Result<()> {
    let backend = hypervisor_backend(config);
    let net = network_backend(config);
    let mut removed = Vec::new();
    let mut failures = Vec::new();
    for r#ref in refs {
        match backend.delete(r#ref, force).await {
            Ok(id) => removed.push(id),
            Err(error) => {
                tracing::warn!(%error, r#ref, "rm failed");
                failures.push((r#ref.clone(), error));
            }
        }
    }
    if !removed.is_empty() {
        net.delete(&removed).await?;
        for id in &removed {
            eprintln!("Removed: {id}");
        }
    }
    join_errors(failures).map_or(Ok(()), Err)?;
    Ok(())
}
