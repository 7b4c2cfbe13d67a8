use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: heap::Location,
    #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
    source: Option<Box<dyn std::error::Error>>,
}

impl GenericError {
    pub fn location(&self) -> heap::Location {
        self.location
    }
}
