//! Print the slot map of a cluster

use std::env;

use valkey_cluster_pipeline::cluster::NodeAddress;
use valkey_cluster_pipeline::{ClientConfig, ClusterClient, ReadPreference};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <host> <port>", args[0]);
        std::process::exit(1);
    }

    let host = &args[1];
    let port: u16 = args[2].parse()?;

    println!("Connecting to {}:{}...", host, port);
    let mut client = ClusterClient::connect(ClientConfig::new(vec![NodeAddress::new(host.as_str(), port)]))?;
    let topology = client.topology();

    let masters = topology.nodes(ReadPreference::Master);
    let replicas = topology.nodes(ReadPreference::Replica);
    println!("Found {} masters, {} replicas", masters.len(), replicas.len());

    for range in topology.slot_ranges() {
        let replicas: Vec<String> = range.replicas.iter().map(|r| r.to_string()).collect();
        println!(
            "{:>5}-{:<5} {:>6} slots  master {}  replicas [{}]",
            range.start,
            range.end,
            range.len(),
            range.master,
            replicas.join(", ")
        );
    }

    client.close();
    println!("Done!");
    Ok(())
}
