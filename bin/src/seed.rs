//! loads the `seed` block of the config into the store
use anyhow::bail;
use config::wire;
use fip_core::prelude::*;
use fip_store::{Instance, Network, NewFloatingIp, Provision};
use ipnet::IpNet;

/// largest pool a CIDR may expand to
const MAX_POOL_SIZE: usize = 1 << 16;

/// Pool CIDRs become one unowned floating ip per usable host address.
/// Addresses the store already holds are kept as they are, so hosts sharing
/// a store can all seed it.
pub async fn populate<S: Provision>(store: &S, seed: &wire::Seed) -> Result<()> {
    let mut ips = Vec::new();
    let mut existing = 0;
    for pool in &seed.pools {
        let addresses = pool_hosts(&pool.cidr)
            .with_context(|| format!("pool {} cannot be expanded", pool.name))?;
        debug!(pool = pool.name, cidr = %pool.cidr, count = addresses.len(), "seeding pool");
        for address in addresses {
            if store
                .floating_ip_get_by_address(address)
                .await
                .with_context(|| format!("failed to look up floating ip {address}"))?
                .is_some()
            {
                existing += 1;
                continue;
            }
            ips.push(NewFloatingIp {
                address,
                pool: pool.name.clone(),
                interface: pool.interface.clone(),
            });
        }
    }
    let floating = ips.len();
    if !ips.is_empty() {
        store
            .floating_ip_bulk_create(ips)
            .await
            .context("failed to seed floating ips")?;
    }

    for instance in &seed.instances {
        store
            .provision_instance(Instance {
                uuid: instance.uuid,
                host: instance.host.clone(),
                project_id: instance.project_id.clone(),
            })
            .await
            .with_context(|| format!("failed to seed instance {}", instance.uuid))?;
    }
    let mut fixed = 0;
    for net in &seed.networks {
        store
            .provision_network(Network {
                id: net.id,
                label: net.label.clone(),
                multi_host: net.multi_host,
                host: net.host.clone(),
            })
            .await
            .with_context(|| format!("failed to seed network {}", net.id))?;
        for ip in &net.fixed_ips {
            store
                .provision_fixed_ip(ip.address, net.id, ip.instance)
                .await
                .with_context(|| format!("failed to seed fixed ip {}", ip.address))?;
            fixed += 1;
        }
    }
    info!(
        floating,
        existing,
        fixed,
        networks = seed.networks.len(),
        instances = seed.instances.len(),
        "store seeded"
    );
    Ok(())
}

fn pool_hosts(cidr: &IpNet) -> Result<Vec<IpAddr>> {
    let host_bits = u32::from(cidr.max_prefix_len() - cidr.prefix_len());
    if host_bits > MAX_POOL_SIZE.trailing_zeros() {
        bail!("{cidr} has more than {MAX_POOL_SIZE} addresses");
    }
    Ok(cidr.hosts().collect())
}
