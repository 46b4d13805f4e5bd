mod table;

use clap::Parser;
use client::{ClientConfig, Link, SyncClient};
use log::{info, warn};
use shared::{PolicyOption, DEFAULT_PORT, OFFLINE_KEY};
use std::rc::Rc;
use std::time::Duration;
use table::{Command, Table};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::LocalSet;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Game to join; a new game is created if omitted
    #[arg(short = 'g', long)]
    game: Option<String>,

    /// Game credential for write-protected topics
    #[arg(short = 'c', long)]
    credential: Option<String>,

    /// Nickname announced after joining
    #[arg(short = 'n', long)]
    nick: Option<String>,

    /// Seconds to wait before reconnecting; 0 disables reconnects
    #[arg(short = 'r', long, default_value = "3")]
    reconnect_delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ClientConfig::new(args.server.clone());
    config.game_id = args.game;
    config.credential = args.credential;
    config.reconnect_delay = (args.reconnect_delay > 0).then(|| Duration::from_secs(args.reconnect_delay));

    info!("Starting table client...");
    info!("Relay: {}", args.server);
    info!("Commands: nick, sit, stand, mouse, spectate, protect, auth, show, quit");

    let local = LocalSet::new();
    local
        .run_until(async move {
            let mut client = SyncClient::new(config);
            let table = Rc::new(Table::register(&client));
            let link = client.link();

            if let Some(nick) = args.nick {
                let nicks = table.nicks.clone();
                client.on_joined(move |session| {
                    nicks.set(session.player_id.clone(), Some(nick.clone()));
                });
            }

            let (quit_tx, quit_rx) = oneshot::channel();
            tokio::task::spawn_local(read_commands(Rc::clone(&table), link, quit_tx));

            client
                .run(async {
                    tokio::select! {
                        _ = quit_rx => {},
                        _ = tokio::signal::ctrl_c() => {},
                    }
                })
                .await
        })
        .await?;

    info!("Bye");
    Ok(())
}

async fn read_commands(table: Rc<Table>, link: Rc<Link>, quit: oneshot::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match Command::parse(&line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => execute(&table, &link, command),
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }

    let _ = quit.send(());
}

fn execute(table: &Table, link: &Link, command: Command) {
    if matches!(command, Command::Show) {
        show(table, link);
        return;
    }

    let Some(player) = link.player_id() else {
        println!("Not connected");
        return;
    };

    match command {
        Command::Nick(nick) => table.nicks.set(player, Some(nick)),
        Command::Sit(seat) => table.seats.set(player, Some(table::SeatInfo { seat: Some(seat) })),
        Command::Stand => table.seats.set(player, Some(table::SeatInfo { seat: None })),
        Command::Mouse(position) => table.mouse.set(player, Some(position)),
        Command::Spectate(on) => {
            if table.spectators.policy().is_write_protected() && !link.is_authenticated() {
                println!("Spectating is password protected, use auth first");
                return;
            }
            let name = table.nicks.get(&player).unwrap_or_else(|| player.clone());
            table.spectators.set(player, on.then_some(name));
        }
        Command::Protect => {
            if !link.is_authenticated() {
                println!("Only authenticated participants can change spectator protection");
                return;
            }
            let protect = !table.spectators.policy().is_write_protected();
            if let Err(e) = table
                .spectators
                .set_policy_option(PolicyOption::WriteProtected(protect))
            {
                warn!("{}", e);
            }
        }
        Command::Auth(credential) => link.authenticate(credential),
        Command::Show | Command::Quit => {}
    }
}

fn show(table: &Table, link: &Link) {
    match link.session() {
        Some(session) => println!(
            "Game {} as {}{}",
            session.game_id,
            session.player_id,
            if link.is_authenticated() { " (authenticated)" } else { "" }
        ),
        None => println!("Not connected"),
    }

    if let Some(info) = table.match_info.get(&0) {
        println!("  dealer: seat {}, honba {}, {}", info.dealer, info.honba, info.game_type);
    }

    let layout = table.layout.borrow();
    for (seat, player) in layout.players().iter().enumerate() {
        let name = player
            .as_ref()
            .map(|player| table.nicks.get(player).unwrap_or_else(|| player.clone()));
        println!("  seat {}: {}", seat, name.as_deref().unwrap_or("-"));
    }
    if let Some(seat) = layout.own_seat() {
        println!("  you sit at seat {}", seat);
    }

    let spectators: Vec<String> = table.spectators.entries().into_iter().map(|(_, nick)| nick).collect();
    if !spectators.is_empty() {
        println!("  spectators: {}", spectators.join(", "));
    }
    println!(
        "  {} things, {} cursors, spectating {}",
        table.things.len(),
        table.mouse.len(),
        if table.spectators.policy().is_write_protected() { "protected" } else { "open" }
    );
    if let Some((player, nick)) = table.nicks.last_offline() {
        println!("  {}: {} ({})", OFFLINE_KEY, nick, player);
    }
}
