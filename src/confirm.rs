use std::io::{self, BufRead, Write};

/// Answers a yes/no question before a potentially destructive step.
pub trait Confirm: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

impl<C: Confirm + ?Sized> Confirm for Box<C> {
    fn confirm(&self, question: &str) -> bool {
        (**self).confirm(question)
    }
}

impl<C: Confirm + ?Sized> Confirm for std::sync::Arc<C> {
    fn confirm(&self, question: &str) -> bool {
        (**self).confirm(question)
    }
}

/// A fixed answer, for non-interactive use.
#[derive(Debug, Clone, Copy)]
pub struct Always(pub bool);

impl Confirm for Always {
    fn confirm(&self, _question: &str) -> bool {
        self.0
    }
}

/// Asks on stderr and reads the answer from stdin. Only `y` or `Y` means yes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl Confirm for StdinPrompt {
    fn confirm(&self, question: &str) -> bool {
        let stdin = io::stdin();
        ask(&mut stdin.lock(), &mut io::stderr(), question).unwrap_or(false)
    }
}

fn ask(input: &mut impl BufRead, output: &mut impl Write, question: &str) -> io::Result<bool> {
    write!(output, "{question} (y/n): ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
