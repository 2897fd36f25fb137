//! Turning a reassembled payload into a dictionary operation and a reply.
//!
//! Commands are whitespace-tokenised UTF-8 text with a case-insensitive
//! verb. Reads (LIST/LOOKUP) take the dictionary's shared lock, mutations
//! (INSERT/UPDATE) the exclusive one; the reply is rendered after the lock
//! is released.

use tokio::sync::RwLock;

use crate::dictionary::Dictionary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Lookup { term: String },
    Insert { term: String, definition: String },
    Update { term: String, definition: String },
}

impl Command {
    /// Tokenise on whitespace runs; the verb is case-insensitive, the term
    /// is a single token and the definition is the remaining tokens joined
    /// by single spaces. `Err` carries the message for a 400 reply.
    pub fn parse(input: &str) -> Result<Command, String> {
        let mut tokens = input.split_whitespace();
        let Some(verb) = tokens.next() else {
            return Err("Empty command".to_string());
        };

        match verb.to_ascii_uppercase().as_str() {
            "LIST" => Ok(Command::List),
            "LOOKUP" => {
                let term = tokens.next().ok_or("LOOKUP requires a term")?;
                Ok(Command::Lookup {
                    term: term.to_string(),
                })
            }
            "INSERT" => {
                let (term, definition) = term_and_definition(&mut tokens, "INSERT")?;
                Ok(Command::Insert { term, definition })
            }
            "UPDATE" => {
                let (term, definition) = term_and_definition(&mut tokens, "UPDATE")?;
                Ok(Command::Update { term, definition })
            }
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

fn term_and_definition<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    verb: &str,
) -> Result<(String, String), String> {
    let term = tokens
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| format!("{} requires a term and a definition", verb))?;
    let definition = tokens.collect::<Vec<_>>().join(" ");
    if definition.trim().is_empty() {
        return Err(format!("{} requires a term and a definition", verb));
    }
    Ok((term.to_string(), definition))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub message: String,
}

impl Response {
    fn new(status: u16, message: impl Into<String>) -> Response {
        Response {
            status,
            message: message.into(),
        }
    }

    /// The wire form: `"<status> <message>"`.
    pub fn render(&self) -> String {
        format!("{} {}", self.status, self.message)
    }
}

/// Parse and run one reassembled command payload against the dictionary.
pub async fn dispatch(payload: &[u8], dictionary: &RwLock<Dictionary>) -> Response {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => return Response::new(400, "Command is not valid UTF-8"),
    };
    match Command::parse(text) {
        Ok(command) => execute(command, dictionary).await,
        Err(message) => Response::new(400, message),
    }
}

pub async fn execute(command: Command, dictionary: &RwLock<Dictionary>) -> Response {
    match command {
        Command::List => {
            let dict = dictionary.read().await;
            if dict.is_empty() {
                Response::new(200, "[empty]")
            } else {
                Response::new(200, dict.list().join("\n"))
            }
        }
        Command::Lookup { term } => match dictionary.read().await.lookup(&term) {
            Some(definition) => Response::new(200, definition),
            None => Response::new(404, format!("Term not found: {}", term)),
        },
        Command::Insert { term, definition } => {
            if dictionary.write().await.insert(&term, &definition) {
                Response::new(201, format!("Term inserted: {}", term))
            } else {
                Response::new(409, format!("Term already exists: {}", term))
            }
        }
        Command::Update { term, definition } => {
            if dictionary.write().await.update(&term, &definition) {
                Response::new(200, format!("Term updated: {}", term))
            } else {
                Response::new(404, format!("Term not found: {}", term))
            }
        }
    }
}
