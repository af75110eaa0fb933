use crate::types::*;

pub type ParseResult<T> = Result<T, String>;

struct Parser<'a> {
	line: &'a [u8],
	i: usize,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum RedirectType { Input, Output }

impl<'a> Parser<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n' | b'\r')
	}

	fn is_letter(c: u8) -> bool {
		match c {
			b'>' | b'<' | b'&' | b'|' => false,
			_ => !Parser::is_whitespace(c),
		}
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Parser::is_whitespace);
	}

	fn read_word(&mut self) -> &'a [u8] {
		let orig = self.i;
		self.proceed_while(Parser::is_letter);
		&self.line[orig .. self.i]
	}

	fn parse_redirect(&mut self) -> ParseResult<Option<(RedirectType, &'a [u8])>> {
		let typ = match self.line.get(self.i) {
			Some(&b'<') => RedirectType::Input,
			Some(&b'>') => RedirectType::Output,
			_ => { return Ok(None); },
		};
		self.i += 1;

		self.skip_whitespaces();
		let target = self.read_word();
		if target.is_empty() {
			return Err("empty redirect".to_string());
		}
		Ok(Some((typ, target)))
	}

	fn parse_redirects(&mut self, redirects: &mut Vec<(RedirectType, &'a [u8])>) -> ParseResult<()> {
		while let Some(redirect) = self.parse_redirect()? {
			redirects.push(redirect);
			self.skip_whitespaces();
		}
		Ok(())
	}

	fn parse_stage(&mut self, redirects: &mut Vec<(RedirectType, &'a [u8])>) -> ParseResult<Stage<'a>> {
		let mut arguments: Vec<&'a [u8]> = vec![];

		self.parse_redirects(redirects)?;

		let name = self.read_word();
		if name.is_empty() {
			return Err("empty command".to_string());
		}

		loop {
			self.skip_whitespaces();
			self.parse_redirects(redirects)?;
			let word = self.read_word();
			if word.is_empty() {
				break;
			}
			arguments.push(word);
		}

		Ok(Stage::new(name, arguments))
	}

	fn parse_command(&mut self) -> ParseResult<Command<'a>> {
		let mut stages: Vec<Stage<'a>> = vec![];
		let mut input = None;
		let mut output = None;
		let mut is_background = false;

		loop {
			self.skip_whitespaces();
			let mut redirects = vec![];
			stages.push(self.parse_stage(&mut redirects)?);
			let index = stages.len() - 1;

			let is_last = match self.line.get(self.i) {
				Some(&b'|') => {
					self.i += 1;
					false
				},
				Some(&b'&') => {
					self.i += 1;
					is_background = true;
					self.skip_whitespaces();
					if let Some(&c) = self.line.get(self.i) {
						return Err(format!("character after '&': '{}'", c as char));
					}
					true
				},
				Some(&c) => { return Err(format!("unknown command separator: '{}'", c as char)); },
				None => true,
			};

			for (typ, target) in redirects {
				match typ {
					RedirectType::Input => {
						if index != 0 {
							return Err("input redirect is only allowed on the first command".to_string());
						}
						input = Some(target);
					},
					RedirectType::Output => {
						if !is_last {
							return Err("output redirect is only allowed on the last command".to_string());
						}
						output = Some(target);
					},
				}
			}

			if is_last {
				break;
			}
		}
		Ok(Command { stages: stages, input: input, output: output, is_background: is_background })
	}
}

pub fn is_blank(line: &[u8]) -> bool {
	line.iter().all(|&c| Parser::is_whitespace(c))
}

pub fn parse(line: &[u8]) -> ParseResult<Command<'_>> {
	let mut parser = Parser { line: line, i: 0 };
	parser.parse_command()
}
