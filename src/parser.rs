use std::fmt;

use thiserror::Error;

use crate::types::*;

pub const MAX_SEGMENTS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("syntax error: {0} needs a file")]
	MissingRedirectTarget(RedirectType),
	#[error("syntax error: too many pipeline segments (max {0})")]
	TooManySegments(usize),
}

impl fmt::Display for RedirectType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match *self {
			RedirectType::Input => "<",
			RedirectType::Output => ">",
			RedirectType::Append => ">>",
		})
	}
}

type ParseResult<T> = Result<T, ParseError>;

struct Parser<I: Iterator<Item = Token>> {
	tokens: I,
	commands: Vec<Command>,
	current: Command,
	is_background: bool,
}

impl<I: Iterator<Item = Token>> Parser<I> {
	fn redirect_target(&mut self, typ: RedirectType) -> ParseResult<Vec<u8>> {
		self.tokens.next()
			.map(Token::into_text)
			.ok_or(ParseError::MissingRedirectTarget(typ))
	}

	fn apply_redirect(&mut self, typ: RedirectType) -> ParseResult<()> {
		let target = self.redirect_target(typ)?;
		match typ {
			RedirectType::Input => { self.current.input = Some(target); },
			RedirectType::Output => {
				self.current.output = Some(OutputRedirect { target, mode: WriteMode::Truncate });
			},
			RedirectType::Append => {
				self.current.output = Some(OutputRedirect { target, mode: WriteMode::Append });
			},
		}
		Ok(())
	}

	fn close_command(&mut self) -> ParseResult<()> {
		if self.commands.len() + 1 >= MAX_SEGMENTS {
			return Err(ParseError::TooManySegments(MAX_SEGMENTS));
		}
		let command = std::mem::take(&mut self.current);
		self.commands.push(command);
		Ok(())
	}

	fn parse_pipeline(mut self, text: &[u8]) -> ParseResult<Pipeline> {
		while let Some(token) = self.tokens.next() {
			match token {
				Token::Word(w) => self.current.arguments.push(w),
				Token::Pipe => self.close_command()?,
				Token::Background => { self.is_background = true; },
				Token::RedirectIn => self.apply_redirect(RedirectType::Input)?,
				Token::RedirectOut => self.apply_redirect(RedirectType::Output)?,
				Token::RedirectAppend => self.apply_redirect(RedirectType::Append)?,
			}
		}
		self.commands.push(self.current);
		Ok(Pipeline { commands: self.commands, is_background: self.is_background, text: text.to_vec() })
	}
}

/// Groups tokens into a pipeline. `text` is kept verbatim for job display.
///
/// Stray `|` tokens yield commands with empty arguments; rejecting those is
/// left to the evaluator.
pub fn parse(tokens: Vec<Token>, text: &[u8]) -> ParseResult<Pipeline> {
	let parser = Parser {
		tokens: tokens.into_iter(),
		commands: vec![],
		current: Command::default(),
		is_background: false,
	};
	parser.parse_pipeline(text)
}
