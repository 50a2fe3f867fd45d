use std::error::Error;

/// What a command hands back to `main`: a value, or an error together with
/// the process exit code.
pub enum ExitResult<T> {
    Ok(T),
    Err(Box<dyn Error>, i32),
}

impl<T> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: i32) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExitResult::Ok(_))
    }

    /// Print the error, if any, and return the exit code.
    pub fn report(self) -> i32 {
        match self {
            ExitResult::Ok(_) => 0,
            ExitResult::Err(b, c) => {
                eprintln!("Error: {}", b);
                c
            }
        }
    }
}
