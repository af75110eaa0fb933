#[derive(Debug, PartialEq, Eq)]
pub struct Stage<'a> {
	pub argv: Vec<&'a [u8]>,
}

impl<'a> Stage<'a> {
	pub fn new(name: &'a [u8], arguments: Vec<&'a [u8]>) -> Stage<'a> {
		let mut argv = Vec::with_capacity(arguments.len() + 1);
		argv.push(name);
		argv.extend(arguments);
		Stage { argv: argv }
	}

	pub fn name(&self) -> &'a [u8] {
		self.argv[0]
	}

	pub fn arguments(&self) -> &[&'a [u8]] {
		&self.argv[1..]
	}
}

/// A parsed command line: stages in data-flow order, redirects that only
/// ever touch the two pipeline ends, and the background flag.
#[derive(Debug, PartialEq, Eq)]
pub struct Command<'a> {
	pub stages: Vec<Stage<'a>>,
	pub input: Option<&'a [u8]>,
	pub output: Option<&'a [u8]>,
	pub is_background: bool,
}

impl<'a> Command<'a> {
	pub fn is_simple(&self) -> bool {
		self.stages.len() == 1
	}
}
