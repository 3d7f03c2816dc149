//! `gc` — runs one full cross-module garbage collection cycle (spec §4.7).

use anyhow::Result;
use cocoon_core::config::Config;
use cocoon_gc::Orchestrator;
use oci_client::secrets::RegistryAuth;

pub async fn run(config: &Config) -> Result<()> {
    let oci = cocoon_oci::OciBackend::open(config.oci_dir(), config.oci_dir().join("images.lock"), RegistryAuth::Anonymous);
    let cloudimg = cocoon_cloudimg::CloudimgBackend::open(config.cloudimg_dir(), config.cloudimg_dir().join("images.lock"), config.firmware_path());
    let net = cocoon_net::NetworkBackend::open(
        config.cni_dir(),
        config.cni_dir().join("networks.lock"),
        config.cni_conf_dir.clone(),
        config.cni_bin_dir.clone(),
    );
    let hypervisor = cocoon_hypervisor::HypervisorBackend::open(config.clone());

    let mut orchestrator = Orchestrator::new();
    orchestrator.register(Box::new(oci.gc_module()));
    orchestrator.register(Box::new(cloudimg.gc_module()));
    orchestrator.register(Box::new(net.gc_module()));
    orchestrator.register(Box::new(hypervisor.gc_module()));

    orchestrator.run().await?;
    Ok(())
}
