use shared::domain::Message;

/// A prefixed chat message split into a name and positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub message: Message,
    name: String,
    args: Vec<String>,
}

impl Command {
    /// `None` unless the content starts with `prefix` and names a command.
    pub fn parse(message: Message, prefix: &str) -> Option<Self> {
        if prefix.is_empty() {
            return None;
        }
        let body = message.content.strip_prefix(prefix)?;
        let mut words = body.split_whitespace();
        let name = words.next()?.to_owned();
        let args = words.map(str::to_owned).collect();
        Some(Self {
            message,
            name,
            args,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn arg_int(&self, index: usize) -> Option<i64> {
        self.arg(index)?.parse().ok()
    }

    /// Arguments from `from` onwards joined by single spaces.
    pub fn rest(&self, from: usize) -> String {
        self.args.get(from..).unwrap_or_default().join(" ")
    }
}

#[cfg(test)]
#[path = "tests/command_tests.rs"]
mod tests;
