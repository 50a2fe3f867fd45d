use super::{
    exit_result::ExitResult,
    rewind_options::{RewindOptions, RewindSubCommand},
    RewindCommand,
    EXIT_CORRUPT,
};
use crate::{
    error::{CheckpointError, Result},
    page_store::GenerationChain,
};
use std::path::{Path, PathBuf};

pub struct VerifyCommand {
    savestate: PathBuf,
}

impl VerifyCommand {
    pub fn new(options: &RewindOptions) -> VerifyCommand {
        match options.cmd.clone() {
            RewindSubCommand::Verify { savestate } => VerifyCommand { savestate },
            _ => panic!("Unexpected RewindSubCommand variant. Not a `Verify` variant!"),
        }
    }
}

/// One line per generation, newest first.
fn verify(path: &Path) -> Result<Vec<String>> {
    let chain = GenerationChain::open(path)?;
    chain.verify()?;
    Ok(chain
        .files()
        .map(|f| {
            let header = &f.meta().header;
            format!(
                "generation {} depth {} {} region(s) {}",
                header.generation,
                header.chain_depth,
                f.meta().regions.len(),
                f.path().display()
            )
        })
        .collect())
}

impl RewindCommand for VerifyCommand {
    fn run(&mut self) -> ExitResult<()> {
        match verify(&self.savestate) {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
                println!("ok");
                ExitResult::Ok(())
            }
            Err(e @ CheckpointError::Corrupt { .. }) => ExitResult::err_from(e, EXIT_CORRUPT),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
