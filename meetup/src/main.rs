//! Five agents must coordinate a meetup. If they show up at different
//! spots then they die, and their communication channels are slow and
//! unreliable. Thankfully, they all understand the Paxos algorithm
//! perfectly: every agent proposes its own city for key 0, and all of
//! them print the one city the cluster chooses.
//!
//!     $ cargo run -p meetup
//!     Jack Harmon: Tokyo
//!     Jim Phelps: Tokyo
//!     Luther Stickell: Tokyo
//!     Franz Krieger: Tokyo
//!     Ethan Hunt: Tokyo

use std::time;

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "meetup")]
struct Opt {
    /// Timeout for each agent's proposal (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "10000")]
    timeout: u64,

    /// Logging level
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbosity: u8,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbosity {
    | 0 => log::LevelFilter::Off,
    | 1 => log::LevelFilter::Info,
    | 2 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}]: {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level_for("synod", level)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let agents = [
        ("Ethan Hunt", "Tokyo"),
        ("Jim Phelps", "Vegas"),
        ("Luther Stickell", "Rio de Janeiro"),
        ("Jack Harmon", "Shanghai"),
        ("Franz Krieger", "Berlin"),
    ];

    // Wire an in-process cluster: every node gets one inbound byte
    // source, and every other node's sink points at it.
    let count = agents.len();
    let mut inbound_txs = Vec::new();
    let mut inbound_rxs = Vec::new();
    for _ in 0..count {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inbound_txs.push(tx);
        inbound_rxs.push(rx);
    }

    let mut nodes = Vec::new();
    for (id, inbound) in inbound_rxs.into_iter().enumerate() {
        let config = synod::Config::new(id, count)
            .with_timeout(time::Duration::from_millis(opt.timeout));
        nodes.push(synod::Node::new(config, synod::MemoryStorage::new(), inbound));
    }
    for (id, node) in nodes.iter().enumerate() {
        for (peer, tx) in inbound_txs.iter().enumerate() {
            if peer != id {
                node.connect_peer(peer, tx.clone());
            }
        }
    }

    // Each agent tries to write key 0 simultaneously.
    let mut proposals = Vec::new();
    for (id, &(agent, city)) in agents.iter().enumerate() {
        let node = nodes[id].clone();
        proposals.push(tokio::spawn(async move {
            let ctx = synod::CancellationToken::new();
            match node.write(&ctx, 0, city.as_bytes().to_vec()).await {
            | Ok(chosen) => println!("{}: {}", agent, String::from_utf8_lossy(&chosen)),
            | Err(error) => eprintln!("{} error: {}", agent, error),
            }
        }));
    }
    for proposal in proposals {
        proposal.await.ok();
    }
}
