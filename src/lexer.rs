use crate::types::Token;

pub const MAX_TOKENS: usize = 256;

struct Lexer<'a> {
	line: &'a [u8],
	i: usize,
}

impl<'a> Lexer<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n')
	}

	fn is_operator(c: u8) -> bool {
		matches!(c, b'>' | b'<' | b'&' | b'|')
	}

	fn is_quote(c: u8) -> bool {
		matches!(c, b'\'' | b'"')
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Lexer::is_whitespace);
	}

	fn read_operator(&mut self) -> Option<Token> {
		let token = match self.line.get(self.i) {
			Some(&b'>') => if self.line.get(self.i + 1) == Some(&b'>') {
				self.i += 1;
				Token::RedirectAppend
			} else {
				Token::RedirectOut
			},
			Some(&b'<') => Token::RedirectIn,
			Some(&b'|') => Token::Pipe,
			Some(&b'&') => Token::Background,
			_ => { return None; },
		};
		self.i += 1;
		Some(token)
	}

	// An unterminated quote swallows the rest of the line.
	fn read_word(&mut self) -> Vec<u8> {
		let mut word = vec![];
		let mut quote: Option<u8> = None;
		while let Some(&c) = self.line.get(self.i) {
			match quote {
				None if Lexer::is_whitespace(c) || Lexer::is_operator(c) => { break; },
				None if Lexer::is_quote(c) => { quote = Some(c); },
				Some(q) if q == c => { quote = None; },
				_ if Lexer::is_quote(c) => {},
				_ => word.push(c),
			}
			self.i += 1;
		}
		word
	}

	fn next_token(&mut self) -> Option<Token> {
		self.skip_whitespaces();
		if self.i >= self.line.len() {
			return None;
		}
		self.read_operator().or_else(|| Some(Token::Word(self.read_word())))
	}
}

/// Splits one input line into tokens. Anything past `MAX_TOKENS` is dropped.
pub fn tokenize(line: &[u8]) -> Vec<Token> {
	let mut lexer = Lexer { line, i: 0 };
	let mut tokens = Vec::new();
	while tokens.len() < MAX_TOKENS {
		match lexer.next_token() {
			Some(token) => tokens.push(token),
			None => { break; },
		}
	}
	tokens
}

#[cfg(test)]
mod tests {
	use super::*;

	fn word(s: &str) -> Token {
		Token::Word(s.as_bytes().to_vec())
	}

	#[test]
	fn operators_split_words_without_spaces() {
		assert_eq!(tokenize(b"a|b"), tokenize(b"a | b"));
		assert_eq!(tokenize(b"a|b"), vec![word("a"), Token::Pipe, word("b")]);
		assert_eq!(
			tokenize(b"cat<in>out&"),
			vec![word("cat"), Token::RedirectIn, word("in"), Token::RedirectOut, word("out"), Token::Background],
		);
	}

	#[test]
	fn double_angle_is_append() {
		assert_eq!(tokenize(b"echo hi >>log"), vec![word("echo"), word("hi"), Token::RedirectAppend, word("log")]);
		assert_eq!(
			tokenize(b"a >>> b"),
			vec![word("a"), Token::RedirectAppend, Token::RedirectOut, word("b")],
		);
	}

	#[test]
	fn quotes_are_stripped_and_protect_specials() {
		assert_eq!(tokenize(b"echo 'a | b' \"c>d\""), vec![word("echo"), word("a | b"), word("c>d")]);
		assert_eq!(tokenize(b"pre'fix suf'fix"), vec![word("prefix suffix")]);
		assert_eq!(tokenize(b"echo \"it's\""), vec![word("echo"), word("its")]);
	}

	#[test]
	fn unterminated_quote_runs_to_end_of_line() {
		assert_eq!(tokenize(b"echo 'abc | def"), vec![word("echo"), word("abc | def")]);
	}

	#[test]
	fn whitespace_only_yields_nothing() {
		assert!(tokenize(b" \t\n").is_empty());
		assert!(tokenize(b"").is_empty());
	}

	#[test]
	fn token_count_is_bounded() {
		let line = "x ".repeat(MAX_TOKENS + 10);
		assert_eq!(tokenize(line.as_bytes()).len(), MAX_TOKENS);
	}
}
