//! relay simulation: compares forwarding modes under several channel conditions

use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use relaying_radio::MediumConfig;
use relaying_sim::scenarios::{self, SessionOutcome};
use relaying_sim::SimulationPresets;

fn print_outcome(label: &str, outcome: &SessionOutcome) {
    println!("{}", format!("  {}", label).bright_white().bold());
    println!(
        "    relay: {} rx ({} ok, {:.1}%), {} tx, {} timeouts, exit {:?}",
        outcome.relay_report.frames_received,
        outcome.relay_report.frames_received_ok,
        outcome.relay_frame_success() * 100.0,
        outcome.relay_report.frames_transmitted,
        outcome.relay_report.timeouts,
        outcome.relay_exit
    );
    for node in &outcome.nodes {
        println!(
            "    node {}: {} payloads ({} bytes) delivered, {} frames sent",
            node.id, node.payloads_delivered, node.bytes_delivered, node.report.frames_transmitted
        );
    }
    println!(
        "    medium: {} sent, {} delivered, {} dropped, {} bits flipped",
        outcome.medium.frames_sent,
        outcome.medium.frames_delivered,
        outcome.medium.frames_dropped,
        outcome.medium.bits_flipped
    );
    println!("    goodput: {}", format!("{:.0} bps", outcome.goodput_bps()).bright_yellow());
}

fn print_conditions(config: &MediumConfig) {
    println!("Bandwidth: {} bps", config.bandwidth_bps);
    println!("Packet Loss: {}%", (config.packet_loss * 100.0) as u32);
    println!("Bit Error Rate: {:e}", config.bit_error_rate);
    println!("Latency: {:?} (jitter {:?})", config.latency, config.latency_jitter);
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let duration = std::env::args()
        .nth(1)
        .map(|s| s.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5));

    println!("{}", "Three-Station Relay Simulation".bright_blue().bold());
    println!("{}", "==============================".bright_blue());
    println!("{} per session", format!("{:?}", duration).bright_white());

    let conditions = [
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    for (name, config) in conditions {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        print_conditions(&config);

        for (mode, outcome) in scenarios::mode_comparison(config, duration).await? {
            print_outcome(&format!("{:?}", mode), &outcome);
        }
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Testing: Extreme Conditions".bright_red().bold());
    let extreme = SimulationPresets::extreme_conditions();
    print_conditions(&extreme);
    let session = scenarios::SessionConfig { duration, ..Default::default() };
    let outcome = scenarios::run_session(extreme, &session).await?;
    print_outcome("NetworkCoded", &outcome);

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
