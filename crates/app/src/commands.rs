//! REPL input parsing

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: a new user turn
    Send(String),
    Regen,
    Prev,
    Next,
    Edit(String),
    Delete,
    Tree,
    Show,
    New,
    Sessions,
    Open(String),
    Rename(String),
    Remove(String),
    /// Show (None) or change the selected model
    Model(Option<String>),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>            send a message
  /regen            new answer for the current turn
  /prev, /next      switch between answers
  /edit <text>      rewrite your last message in place
  /delete           delete the current message and everything below it
  /tree             show the conversation tree
  /show             show the current branch
  /new              start a new conversation
  /sessions         list conversations
  /open <id>        switch conversation
  /rename <name>    rename this conversation
  /remove <id>      delete a conversation
  /model [key]      show or select <profile>/<model>
  /quit
Ctrl-C while an answer streams cancels it.";

/// `None` for blank input.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let required = |what: &str| -> Result<String, String> {
        if arg.is_empty() {
            Err(format!("/{} needs {}", name, what))
        } else {
            Ok(arg.to_string())
        }
    };

    let command = match name {
        "regen" | "retry" => Command::Regen,
        "prev" => Command::Prev,
        "next" => Command::Next,
        "edit" => Command::Edit(required("the new text")?),
        "delete" => Command::Delete,
        "tree" => Command::Tree,
        "show" => Command::Show,
        "new" => Command::New,
        "sessions" => Command::Sessions,
        "open" => Command::Open(required("a session id")?),
        "rename" => Command::Rename(required("a name")?),
        "remove" => Command::Remove(required("a session id")?),
        "model" => Command::Model((!arg.is_empty()).then(|| arg.to_string())),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command /{} (try /help)", other)),
    };
    Ok(Some(command))
}
