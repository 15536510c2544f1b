use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use guild_core::{
    load_guild_config_from_env, ClaimChange, ClaimKey, ClaimObserver, FlushEvent, GuildError,
    GuildHome, GuildId, GuildService, NoEconomy, PlayerId,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, config_path) = load_guild_config_from_env();
    let command_bind = config.server().command_bind();
    let tick_interval = config.server().tick_interval();
    let shutdown_timeout = config.server().shutdown_timeout();

    let mut service = match GuildService::start(config, Box::new(NoEconomy)) {
        Ok(service) => service,
        Err(err) => {
            error!(target: "guilds::server", error = %err, "server.startup_failed");
            std::process::exit(1);
        }
    };
    service.add_claim_observer(Box::new(ClaimLog));

    let command_rx = match spawn_command_listener(command_bind) {
        Ok(rx) => rx,
        Err(err) => {
            error!(target: "guilds::server", %command_bind, error = %err, "server.bind_failed");
            std::process::exit(1);
        }
    };

    info!(
        target: "guilds::server",
        %command_bind,
        tick_ms = tick_interval.as_millis() as u64,
        config = ?config_path,
        guilds = service.guild_count(),
        "Guild server ready"
    );

    let mut next_tick = Instant::now() + tick_interval;
    'running: loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match command_rx.recv_timeout(wait) {
            Ok(Command::Shutdown) => break 'running,
            Ok(command) => handle_command(&mut service, command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break 'running,
        }

        if Instant::now() >= next_tick {
            for event in service.tick() {
                log_flush_event(&event);
            }
            next_tick += tick_interval;
        }
    }

    info!(target: "guilds::server", "server.shutting_down");
    if let Err(err) = service.shutdown(shutdown_timeout) {
        error!(target: "guilds::server", error = %err, "server.save_incomplete");
        std::process::exit(2);
    }
}

#[derive(Debug)]
enum Command {
    Create { name: String, owner: PlayerId },
    Disband { actor: PlayerId, guild: GuildId },
    Join { guild: GuildId, player: PlayerId },
    Invite { actor: PlayerId, guild: GuildId, player: PlayerId },
    Accept { player: PlayerId, guild: GuildId },
    Leave { player: PlayerId, successor: Option<PlayerId> },
    Kick { actor: PlayerId, guild: GuildId, player: PlayerId },
    Rank { actor: PlayerId, guild: GuildId, player: PlayerId, ordinal: u16 },
    Transfer { actor: PlayerId, guild: GuildId, successor: PlayerId },
    Claim { actor: PlayerId, guild: GuildId, key: ClaimKey },
    Unclaim { actor: PlayerId, guild: GuildId, key: ClaimKey },
    Deposit { actor: PlayerId, guild: GuildId, amount: i64 },
    Withdraw { actor: PlayerId, guild: GuildId, amount: i64 },
    Rename { actor: PlayerId, guild: GuildId, name: String },
    Pvp { actor: PlayerId, guild: GuildId, enabled: bool },
    Exp { guild: GuildId, amount: u64 },
    Upgrade { actor: PlayerId, guild: GuildId, name: String, level: u32 },
    SetHome { actor: PlayerId, guild: GuildId, name: String, home: GuildHome },
    DeleteHome { actor: PlayerId, guild: GuildId, name: String },
    Home { actor: PlayerId, guild: GuildId, name: String },
    Owner { key: ClaimKey },
    Save,
    Shutdown,
}

struct ClaimLog;

impl ClaimObserver for ClaimLog {
    fn claim_changed(&self, change: &ClaimChange) {
        info!(
            target: "guilds::server",
            key = %change.key,
            previous = ?change.previous,
            current = ?change.current,
            "claim.changed"
        );
    }
}

fn handle_command(service: &mut GuildService, command: Command) {
    let label = command_label(&command);
    let result: Result<String, GuildError> = match command {
        Command::Create { name, owner } => service
            .create_guild(&name, owner)
            .map(|id| format!("guild {id}")),
        Command::Disband { actor, guild } => service.disband_guild(actor, guild).map(|()| String::new()),
        Command::Join { guild, player } => service.add_member(guild, player).map(|()| String::new()),
        Command::Invite { actor, guild, player } => {
            service.invite(actor, guild, player).map(|()| String::new())
        }
        Command::Accept { player, guild } => service.accept_invite(player, guild).map(|()| String::new()),
        Command::Leave { player, successor } => match service.guild_of(player) {
            Some(guild) => service
                .remove_member(player, guild, player, successor)
                .map(|()| format!("left guild {guild}")),
            None => {
                warn!(target: "guilds::server", %player, "command.rejected=not_in_guild");
                return;
            }
        },
        Command::Kick { actor, guild, player } => service
            .remove_member(actor, guild, player, None)
            .map(|()| String::new()),
        Command::Rank {
            actor,
            guild,
            player,
            ordinal,
        } => service.set_rank(actor, guild, player, ordinal).map(|()| String::new()),
        Command::Transfer {
            actor,
            guild,
            successor,
        } => service
            .transfer_ownership(actor, guild, successor)
            .map(|()| String::new()),
        Command::Claim { actor, guild, key } => service.claim(actor, guild, key).map(|()| String::new()),
        Command::Unclaim { actor, guild, key } => {
            service.unclaim(actor, guild, &key).map(|()| String::new())
        }
        Command::Deposit { actor, guild, amount } => service
            .deposit(actor, guild, amount)
            .map(|balance| format!("balance {balance}")),
        Command::Withdraw { actor, guild, amount } => service
            .withdraw(actor, guild, amount)
            .map(|balance| format!("balance {balance}")),
        Command::Rename { actor, guild, name } => {
            service.rename_guild(actor, guild, &name).map(|()| String::new())
        }
        Command::Pvp { actor, guild, enabled } => service.set_pvp(actor, guild, enabled).map(|()| String::new()),
        Command::Exp { guild, amount } => service.add_exp(guild, amount).map(|level| format!("level {level}")),
        Command::Upgrade {
            actor,
            guild,
            name,
            level,
        } => service
            .set_upgrade(actor, guild, &name, level)
            .map(|()| String::new()),
        Command::SetHome {
            actor,
            guild,
            name,
            home,
        } => service
            .set_home(actor, guild, &name, home)
            .map(|()| format!("home {name}")),
        Command::DeleteHome { actor, guild, name } => {
            service.delete_home(actor, guild, &name).map(|()| String::new())
        }
        Command::Home { actor, guild, name } => service
            .home(actor, guild, &name)
            .map(|home| format!("{} {} {} {} {} {}", home.world, home.x, home.y, home.z, home.yaw, home.pitch)),
        Command::Owner { key } => {
            let owner = service.claim_owner(&key);
            info!(target: "guilds::server", key = %key, owner = ?owner, "query.claim_owner");
            return;
        }
        Command::Save => {
            let dispatched = service.flush_now();
            info!(target: "guilds::server", dispatched, "command.applied=save");
            return;
        }
        Command::Shutdown => return,
    };

    match result {
        Ok(detail) => info!(target: "guilds::server", command = label, detail = %detail, "command.applied"),
        Err(err) => warn!(
            target: "guilds::server",
            command = label,
            kind = ?err.kind(),
            error = %err,
            "command.rejected"
        ),
    }
}

fn command_label(command: &Command) -> &'static str {
    match command {
        Command::Create { .. } => "create",
        Command::Disband { .. } => "disband",
        Command::Join { .. } => "join",
        Command::Invite { .. } => "invite",
        Command::Accept { .. } => "accept",
        Command::Leave { .. } => "leave",
        Command::Kick { .. } => "kick",
        Command::Rank { .. } => "rank",
        Command::Transfer { .. } => "transfer",
        Command::Claim { .. } => "claim",
        Command::Unclaim { .. } => "unclaim",
        Command::Deposit { .. } => "deposit",
        Command::Withdraw { .. } => "withdraw",
        Command::Rename { .. } => "rename",
        Command::Pvp { .. } => "pvp",
        Command::Exp { .. } => "exp",
        Command::Upgrade { .. } => "upgrade",
        Command::SetHome { .. } => "sethome",
        Command::DeleteHome { .. } => "delhome",
        Command::Home { .. } => "home",
        Command::Owner { .. } => "owner",
        Command::Save => "save",
        Command::Shutdown => "shutdown",
    }
}

fn log_flush_event(event: &FlushEvent) {
    match event {
        FlushEvent::Persisted { .. } => {}
        FlushEvent::RetryScheduled { guild, attempt, .. } => {
            warn!(target: "guilds::server", %guild, attempt, "flush.retrying")
        }
        FlushEvent::Quarantined { guild, error, .. } => {
            error!(target: "guilds::server", %guild, error = %error, "guild.quarantined")
        }
        FlushEvent::Released { guild } => info!(target: "guilds::server", %guild, "guild.released"),
    }
}

/// Pause after a failed `accept`, so a persistent error such as running out
/// of file descriptors does not spin the listener thread.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Accepts command clients on a dedicated thread. `accept` blocks, so an idle
/// listener costs nothing; each client gets its own reader thread.
fn spawn_command_listener(bind_addr: SocketAddr) -> std::io::Result<Receiver<Command>> {
    let listener = TcpListener::bind(bind_addr)?;
    let (sender, receiver) = unbounded::<Command>();
    thread::Builder::new()
        .name("guild-command-listener".into())
        .spawn(move || accept_loop(&listener, &sender))?;
    Ok(receiver)
}

fn accept_loop(listener: &TcpListener, sender: &Sender<Command>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target: "guilds::server", error = %err, "client.accept_failed");
                thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        info!(target: "guilds::server", addr = ?peer, "client.connected");
        let sender = sender.clone();
        let spawned = thread::Builder::new()
            .name("guild-command-client".into())
            .spawn(move || read_commands(stream, &sender));
        if let Err(err) = spawned {
            warn!(target: "guilds::server", addr = ?peer, error = %err, "client.spawn_failed");
        }
    }
}

/// Forwards one command per line until the client hangs up or the tick
/// loop stops listening.
fn read_commands(stream: TcpStream, sender: &Sender<Command>) {
    for line in BufReader::new(stream).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "guilds::server", error = %err, "client.read_failed");
                return;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match parse_command(input) {
            Some(command) => {
                if sender.send(command).is_err() {
                    return;
                }
            }
            None => warn!(target: "guilds::server", input, "command.invalid"),
        }
    }
    debug!(target: "guilds::server", "client.disconnected");
}

fn parse_command(input: &str) -> Option<Command> {
    let mut parts = input.split_whitespace();
    let verb = parts.next()?;
    let command = match verb {
        "save" => Command::Save,
        "shutdown" | "stop" => Command::Shutdown,
        "owner" => {
            let rest: Vec<&str> = input.split_whitespace().skip(1).collect();
            Command::Owner {
                key: parse_key(&rest)?,
            }
        }
        "create" => {
            let args: Vec<&str> = input.split_whitespace().skip(1).collect();
            let [name, owner] = args.as_slice() else {
                return None;
            };
            Command::Create {
                name: (*name).to_string(),
                owner: owner.parse().ok()?,
            }
        }
        "exp" => {
            let args: Vec<&str> = input.split_whitespace().skip(1).collect();
            Command::Exp {
                guild: parse_guild(args.first()?)?,
                amount: args.get(1)?.parse().ok()?,
            }
        }
        "join" => {
            let args: Vec<&str> = input.split_whitespace().skip(1).collect();
            Command::Join {
                guild: parse_guild(args.first()?)?,
                player: args.get(1)?.parse().ok()?,
            }
        }
        "leave" => {
            let leaver: PlayerId = parts.next()?.parse().ok()?;
            let successor = match parts.next() {
                Some(raw) => Some(raw.parse().ok()?),
                None => None,
            };
            Command::Leave {
                player: leaver,
                successor,
            }
        }
        _ => return parse_actor_command(verb, input),
    };
    Some(command)
}

/// Verbs of the form `<verb> <actor> <guild> ...`.
fn parse_actor_command(verb: &str, input: &str) -> Option<Command> {
    let args: Vec<&str> = input.split_whitespace().skip(1).collect();
    let actor: PlayerId = args.first()?.parse().ok()?;
    let guild = parse_guild(args.get(1)?)?;
    let rest = &args[2..];
    let command = match verb {
        "disband" => Command::Disband { actor, guild },
        "invite" => Command::Invite {
            actor,
            guild,
            player: rest.first()?.parse().ok()?,
        },
        "accept" => Command::Accept {
            player: actor,
            guild,
        },
        "kick" => Command::Kick {
            actor,
            guild,
            player: rest.first()?.parse().ok()?,
        },
        "rank" => Command::Rank {
            actor,
            guild,
            player: rest.first()?.parse().ok()?,
            ordinal: rest.get(1)?.parse().ok()?,
        },
        "transfer" => Command::Transfer {
            actor,
            guild,
            successor: rest.first()?.parse().ok()?,
        },
        "claim" => Command::Claim {
            actor,
            guild,
            key: parse_key(rest)?,
        },
        "unclaim" => Command::Unclaim {
            actor,
            guild,
            key: parse_key(rest)?,
        },
        "deposit" => Command::Deposit {
            actor,
            guild,
            amount: rest.first()?.parse().ok()?,
        },
        "withdraw" => Command::Withdraw {
            actor,
            guild,
            amount: rest.first()?.parse().ok()?,
        },
        "rename" => Command::Rename {
            actor,
            guild,
            name: (*rest.first()?).to_string(),
        },
        "pvp" => Command::Pvp {
            actor,
            guild,
            enabled: match *rest.first()? {
                "on" | "true" => true,
                "off" | "false" => false,
                _ => return None,
            },
        },
        "upgrade" => Command::Upgrade {
            actor,
            guild,
            name: (*rest.first()?).to_string(),
            level: rest.get(1)?.parse().ok()?,
        },
        "sethome" => Command::SetHome {
            actor,
            guild,
            name: (*rest.first()?).to_string(),
            home: parse_home(&rest[1..])?,
        },
        "delhome" => Command::DeleteHome {
            actor,
            guild,
            name: (*rest.first()?).to_string(),
        },
        "home" => Command::Home {
            actor,
            guild,
            name: (*rest.first()?).to_string(),
        },
        other => {
            warn!(target: "guilds::server", verb = other, "command.unknown");
            return None;
        }
    };
    Some(command)
}

fn parse_guild(raw: &str) -> Option<GuildId> {
    raw.parse::<u64>().ok().map(GuildId)
}

/// `<world> <x> <z>`
fn parse_key(args: &[&str]) -> Option<ClaimKey> {
    let [world, x, z] = args else {
        return None;
    };
    Some(ClaimKey::new(*world, x.parse().ok()?, z.parse().ok()?))
}

/// `<world> <x> <y> <z> [<yaw> <pitch>]`
fn parse_home(args: &[&str]) -> Option<GuildHome> {
    let (position, facing) = match args.len() {
        4 => (args, None),
        6 => (&args[..4], Some(&args[4..])),
        _ => return None,
    };
    let home = GuildHome::new(
        position[0],
        position[1].parse().ok()?,
        position[2].parse().ok()?,
        position[3].parse().ok()?,
    );
    match facing {
        Some(facing) => Some(home.facing(facing[0].parse().ok()?, facing[1].parse().ok()?)),
        None => Some(home),
    }
}
