// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use slog::{o, Drain};

use dlb2::hw::sim::SimDevice;
use dlb2::mbox::{Loopback, VfNotification};
use dlb2::rsrc::NumResources;
use dlb2::{Dlb2, Func, Id, NoopWorker};
use dlb2_config_toml::{Config, VfConfig};

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn assign_vf(dlb: &mut Dlb2, vdev: u8, vf: &VfConfig) -> anyhow::Result<()> {
    if let Some(n) = vf.domains {
        dlb.update_vdev_sched_domains(vdev, n)?;
    }
    if let Some(n) = vf.ldb_queues {
        dlb.update_vdev_ldb_queues(vdev, n)?;
    }
    if let Some(n) = vf.ldb_ports {
        dlb.update_vdev_ldb_ports(vdev, n)?;
    }
    if let Some(ports) = vf.cos_ldb_ports {
        for (cos, n) in (0u8..).zip(ports) {
            dlb.update_vdev_ldb_cos_ports(vdev, cos, n)?;
        }
    }
    if let Some(n) = vf.dir_ports {
        dlb.update_vdev_dir_ports(vdev, n)?;
    }
    if let Some(n) = vf.ldb_credits {
        dlb.update_vdev_ldb_credits(vdev, n)?;
    }
    if let Some(n) = vf.dir_credits {
        dlb.update_vdev_dir_credits(vdev, n)?;
    }
    if let Some(n) = vf.atomic_inflights {
        dlb.update_vdev_atomic_inflights(vdev, n)?;
    }
    if let Some(n) = vf.hist_list_entries {
        dlb.update_vdev_hist_list_entries(vdev, n)?;
    }
    if vf.lock {
        dlb.lock_vdev(vdev)?;
    }
    Ok(())
}

/// Build a manager on the simulated device and apply everything but the
/// domains described by `config`.
fn setup(log: &slog::Logger, config: &Config) -> anyhow::Result<Dlb2> {
    let sim = Arc::new(SimDevice::new());
    let mut dlb = Dlb2::new(log.clone(), config.device_limits(), sim)
        .context("failed to build resource manager")?;
    dlb.set_worker(Arc::new(NoopWorker));
    dlb.set_mailbox(Arc::new(Loopback::new()), config.mailbox.policy());

    for (group, &mode) in (0u32..).zip(&config.sn_groups.modes) {
        dlb.set_group_sequence_numbers(group, mode).with_context(|| {
            format!("failed to set sequence number group {group}")
        })?;
    }
    if let Some(bandwidth) = config.cos.bandwidth {
        // Lower every class first so the running total never exceeds 100%.
        for cos in 0..bandwidth.len() as u8 {
            dlb.set_cos_bandwidth(cos, 0)?;
        }
        for (cos, bw) in (0u8..).zip(bandwidth) {
            dlb.set_cos_bandwidth(cos, bw).with_context(|| {
                format!("failed to reserve bandwidth for cos {cos}")
            })?;
        }
    }
    for (vdev, vf) in config.vf_assignments()? {
        assign_vf(&mut dlb, vdev, vf).with_context(|| {
            format!("failed to assign resources to vf{vdev}")
        })?;
    }
    Ok(dlb)
}

/// Handle through which the PF addresses a domain created for `func`.
fn domain_handle(dlb: &Dlb2, func: Func, id: u32) -> anyhow::Result<Id> {
    match func.vdev() {
        Some(vdev) if dlb.vdev_is_locked(vdev)? => Ok(Id::new(func, id)),
        _ => Ok(Id::Physical(id)),
    }
}

/// Start every domain, then tear them down again: PF domains one at a time
/// and VF domains through a whole-VF reset bracketed by notifications.
fn cycle_domains(
    log: &slog::Logger,
    dlb: &mut Dlb2,
    created: &[(String, Func, Id)],
) -> anyhow::Result<()> {
    for (name, _, id) in created {
        dlb.start_domain(*id)
            .with_context(|| format!("failed to start domain {name}"))?;
    }
    for (name, func, id) in created {
        if *func == Func::Pf {
            dlb.reset_domain(*id)
                .with_context(|| format!("failed to reset domain {name}"))?;
            slog::info!(log, "domain reset"; "name" => name);
        }
    }

    let mut vdevs: Vec<u8> =
        created.iter().filter_map(|(_, func, _)| func.vdev()).collect();
    vdevs.sort_unstable();
    vdevs.dedup();
    for vdev in vdevs {
        dlb.notify_vf(vdev, VfNotification::PreReset)?;
        dlb.reset_vdev(vdev)
            .with_context(|| format!("failed to reset vf{vdev}"))?;
        dlb.notify_vf(vdev, VfNotification::PostReset)?;
        slog::info!(log, "vf reset"; "vdev" => vdev);
    }
    Ok(())
}

#[derive(Serialize)]
struct FuncReport {
    func: String,
    avail: NumResources,
    used: NumResources,
}

fn report(dlb: &Dlb2) -> anyhow::Result<Vec<FuncReport>> {
    let funcs = std::iter::once(Func::Pf)
        .chain((0..dlb.limits().num_vdevs).map(Func::Vf));
    let mut out = Vec::new();
    for func in funcs {
        let avail = dlb.get_num_resources(func)?;
        let used = dlb.get_num_used_resources(func)?;
        // Skip VFs which were never given anything.
        if func != Func::Pf
            && avail == NumResources::default()
            && used == NumResources::default()
        {
            continue;
        }
        out.push(FuncReport { func: func.to_string(), avail, used });
    }
    Ok(out)
}

fn print_totals(label: &str, num: &NumResources) {
    println!(
        "  {label:<6} domains {:>3}  ldb queues {:>3}  ldb ports {:>3} {:?}  \
         dir ports {:>3}",
        num.num_sched_domains,
        num.num_ldb_queues,
        num.num_ldb_ports,
        num.num_cos_ldb_ports,
        num.num_dir_ports,
    );
    println!(
        "  {:<6} ldb credits {:>5}  dir credits {:>5}  atomic inflights \
         {:>5}  hist list {:>5} (max run {})",
        "",
        num.num_ldb_credits,
        num.num_dir_credits,
        num.num_atomic_inflights,
        num.num_hist_list_entries,
        num.max_contiguous_hist_list_entries,
    );
}

#[derive(clap::Parser)]
/// Carve a simulated DLB 2.0 device into scheduling domains and report
/// where its resources ended up.
struct Args {
    /// Device description
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Start every created domain and then reset it.
    #[clap(short, long, action)]
    reset: bool,

    /// Print the resource report as JSON.
    #[clap(short, long, action)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { config, reset, json } = Args::parse();

    let (log, _log_async_guard) = build_log();

    let config = dlb2_config_toml::parse(&config)
        .with_context(|| format!("failed to parse {config}"))?;
    let mut dlb = setup(&log, &config)?;

    let mut created = Vec::new();
    for (name, dom) in &config.domains {
        let func = dom.owner().map_err(anyhow::Error::msg)?;
        let id = dlb
            .create_sched_domain(func, &dom.args)
            .with_context(|| format!("failed to create domain {name}"))?;
        slog::info!(log, "domain created";
            "name" => name, "owner" => %func, "id" => id);
        created.push((name.clone(), func, domain_handle(&dlb, func, id)?));
    }

    if reset {
        cycle_domains(&log, &mut dlb, &created)?;
    }

    let report = report(&dlb)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for func in &report {
            println!("{}:", func.func);
            print_totals("avail", &func.avail);
            print_totals("used", &func.used);
        }
    }
    Ok(())
}
