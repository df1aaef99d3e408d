#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
	Word(Vec<u8>),
	Pipe,
	RedirectIn,
	RedirectOut,
	RedirectAppend,
	Background,
}

impl Token {
	/// The characters this token was read from, with quotes already stripped.
	pub fn into_text(self) -> Vec<u8> {
		match self {
			Token::Word(w) => w,
			Token::Pipe => b"|".to_vec(),
			Token::RedirectIn => b"<".to_vec(),
			Token::RedirectOut => b">".to_vec(),
			Token::RedirectAppend => b">>".to_vec(),
			Token::Background => b"&".to_vec(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectType { Input, Output, Append }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode { Truncate, Append }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRedirect {
	pub target: Vec<u8>,
	pub mode: WriteMode,
}

/// One stage of a pipeline. `arguments[0]` is the program name; an empty
/// `arguments` is only ever produced by stray `|` tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
	pub arguments: Vec<Vec<u8>>,
	pub input: Option<Vec<u8>>,
	pub output: Option<OutputRedirect>,
}

impl Command {
	pub fn name(&self) -> Option<&[u8]> {
		self.arguments.first().map(|a| a.as_slice())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
	pub commands: Vec<Command>,
	pub is_background: bool,
	pub text: Vec<u8>,
}
