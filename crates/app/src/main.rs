use anyhow::Result;
use chat_engine::{
    share, ChatExecutor, DefaultContextPipeline, ExecuteOutcome, SettingsProfileResolver,
    SharedSession, SiblingDirection,
};
use providers::ProviderRouter;
use services::SessionStore;
use shared::conversation::NodeStatus;
use shared::events::ChatEvent;
use shared::settings::GatewaySettings;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod render;

use commands::Command;

struct Repl {
    settings: GatewaySettings,
    store: Arc<SessionStore>,
    executor: ChatExecutor,
    events: UnboundedReceiver<ChatEvent>,
    session: SharedSession,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (settings, fresh) = config::load_settings_or_default();
    if fresh {
        if let Err(e) = config::save_settings(&settings) {
            tracing::warn!(error = %e, "could not write default settings");
        }
    }

    let store = Arc::new(SessionStore::open_default()?);
    let (events_tx, events) = mpsc::unbounded_channel();
    let executor = ChatExecutor::new(
        Arc::new(ProviderRouter::new(settings.clone())),
        Arc::new(SettingsProfileResolver::new(settings.clone())),
        Arc::new(DefaultContextPipeline::from_settings(&settings)),
    )
    .with_persistence(store.clone())
    .with_events(events_tx)
    .with_streaming(settings.stream)
    .with_selected_model(settings.selected_model.clone());

    let session = share(store.load_or_create_active(settings.system_prompt.as_deref())?);
    tracing::info!(session = %session.lock().id, "ready");

    let mut repl = Repl {
        settings,
        store,
        executor,
        events,
        session,
    };
    println!("Little Helper - {} (/help for commands)\n", repl.session.lock().name);
    print!("{}", render::transcript(&repl.session.lock()));
    repl.run().await
}

impl Repl {
    async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match commands::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    println!("{}", message);
                    continue;
                }
            };
            if command == Command::Quit {
                break;
            }
            if let Err(e) = self.handle(command).await {
                println!("error: {:#}", e);
            }
        }
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Send(text) => {
                let executor = &self.executor;
                let session = self.session.clone();
                let outcome = stream_turn(
                    executor,
                    &mut self.events,
                    &session,
                    executor.execute(&session, &text, None),
                )
                .await;
                report(&outcome);
            }
            Command::Regen => {
                let Some(leaf) = self.session.lock().active_leaf().map(|n| n.id.clone()) else {
                    return Ok(());
                };
                let executor = &self.executor;
                let session = self.session.clone();
                let outcome = stream_turn(
                    executor,
                    &mut self.events,
                    &session,
                    async { executor.regenerate(&session, &leaf).await },
                )
                .await;
                match outcome {
                    Ok(outcome) => report(&outcome),
                    Err(e) => println!("can't regenerate here: {}", e),
                }
            }
            Command::Prev | Command::Next => {
                let direction = if command == Command::Prev {
                    SiblingDirection::Prev
                } else {
                    SiblingDirection::Next
                };
                let mut session = self.session.lock();
                match render::branch_point(&session) {
                    Some(node) => {
                        let landed = self
                            .executor
                            .switch_to_sibling_branch(&mut session, &node, direction);
                        if landed == node {
                            println!("no more answers that way");
                        } else {
                            self.store.save(&session)?;
                            print!("{}", render::transcript(&session));
                        }
                    }
                    None => println!("nothing to switch between"),
                }
            }
            Command::Edit(text) => {
                let mut session = self.session.lock();
                match render::last_user_turn(&session) {
                    Some(node) if self.executor.edit_message(&mut session, &node, &text) => {
                        self.store.save(&session)?;
                        println!("edited; /regen for a new answer");
                    }
                    _ => println!("no message of yours to edit"),
                }
            }
            Command::Delete => {
                let mut session = self.session.lock();
                let leaf = session.active_leaf_id.clone();
                let outcome = self.executor.delete_message(&mut session, &leaf);
                if outcome.success {
                    self.store.save(&session)?;
                    println!("deleted {} message(s)", outcome.deleted_nodes.len());
                } else {
                    println!("nothing to delete");
                }
            }
            Command::Tree => print!("{}", render::tree(&self.session.lock())),
            Command::Show => print!("{}", render::transcript(&self.session.lock())),
            Command::New => {
                let session = self.store.create(self.settings.system_prompt.as_deref())?;
                println!("started {}", session.id);
                self.session = share(session);
            }
            Command::Sessions => {
                let current = self.session.lock().id.clone();
                for summary in self.store.list() {
                    let marker = if summary.id == current { '*' } else { ' ' };
                    println!(
                        "{} {}  {}  ({} messages, {})",
                        marker,
                        summary.id,
                        summary.name,
                        summary.message_count,
                        summary.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Command::Open(id) => {
                let session = self.store.load(&id)?;
                self.store.set_active(&session.id)?;
                println!("{}\n", session.name);
                print!("{}", render::transcript(&session));
                self.session = share(session);
            }
            Command::Rename(name) => {
                let id = self.session.lock().id.clone();
                let renamed = self.store.rename(&id, &name)?;
                self.session.lock().name = renamed.name;
            }
            Command::Remove(id) => {
                if id == self.session.lock().id {
                    println!("can't remove the open conversation");
                } else if self.store.delete(&id)? {
                    println!("removed {}", id);
                } else {
                    println!("no conversation {}", id);
                }
            }
            Command::Model(None) => {
                println!(
                    "selected: {}",
                    self.executor.selected_model().unwrap_or_else(|| "(none)".into())
                );
                for profile in self.settings.profiles.iter().filter(|p| p.enabled) {
                    for model in &profile.models {
                        println!("  {}/{}  {}", profile.id, model.id, model.name);
                    }
                }
            }
            Command::Model(Some(key)) => {
                self.executor.select_model(Some(key.clone()));
                self.settings.selected_model = Some(key);
                config::save_settings(&self.settings)?;
            }
            Command::Help => println!("{}", commands::HELP),
            Command::Quit => {}
        }
        Ok(())
    }
}

/// Drive one generation, echoing deltas and cancelling on Ctrl-C.
async fn stream_turn<T>(
    executor: &ChatExecutor,
    events: &mut UnboundedReceiver<ChatEvent>,
    session: &SharedSession,
    turn: impl Future<Output = T>,
) -> T {
    let session_id = session.lock().id.clone();
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            Some(event) = events.recv() => print_event(&event),
            _ = tokio::signal::ctrl_c() => {
                executor.cancel(&session_id);
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    result
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::Started { .. } => {}
        ChatEvent::Delta { text, .. } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        ChatEvent::Finished { .. } => println!(),
    }
}

fn report(outcome: &ExecuteOutcome) {
    match outcome {
        ExecuteOutcome::Busy => println!("still answering; Ctrl-C to stop it"),
        ExecuteOutcome::Invalid(e) => println!("{} (see /model)", e),
        ExecuteOutcome::Rejected(e) => println!("{}", e),
        ExecuteOutcome::Finished {
            status: NodeStatus::Error,
            ..
        } => println!("(answer failed; /regen to retry)"),
        ExecuteOutcome::Finished { .. } => {}
    }
}
