use crate::error::{Result, SessionError};
use crate::format::{format_file_size, format_listing, format_nodes};
use crate::session::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Show,
    Cd(String),
    Ls,
    Get(String),
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("show", []) => Self::Show,
            ("show", _) => return Err(SessionError::input("usage: show")),
            ("cd", [path]) => Self::Cd((*path).to_string()),
            ("cd", _) => return Err(SessionError::input("usage: cd <path>")),
            ("ls", []) => Self::Ls,
            ("ls", _) => return Err(SessionError::input("usage: ls")),
            ("get", [file]) => Self::Get((*file).to_string()),
            ("get", _) => return Err(SessionError::input("usage: get <file>")),
            (other, _) => {
                return Err(SessionError::input(format!("unknown command: {other}")))
            }
        };
        Ok(Some(command))
    }
}

/// Runs command lines against a session and renders the output.
pub struct CommandInterpreter {
    session: SessionManager,
}

impl CommandInterpreter {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    pub fn prompt(&self) -> String {
        self.session.prompt()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    /// Output for `line`, possibly empty. Failures come back as
    /// `Error: <message>`.
    pub async fn interpret(&mut self, line: &str) -> String {
        match self.execute(line).await {
            Ok(output) => output,
            Err(err) => err.render(),
        }
    }

    async fn execute(&mut self, line: &str) -> Result<String> {
        let Some(command) = Command::parse(line)? else {
            return Ok(String::new());
        };
        match command {
            Command::Show => Ok(format_nodes(&self.session.show())),
            Command::Cd(path) => {
                self.session.cd(&path)?;
                Ok(String::new())
            }
            Command::Ls => Ok(format_listing(&self.session.ls().await?)),
            Command::Get(file) => {
                let download = self.session.get(&file).await?;
                Ok(format!(
                    "Downloaded {file} ({})",
                    format_file_size(download.bytes)
                ))
            }
        }
    }

    pub fn close(&mut self) {
        self.session.close();
    }
}
