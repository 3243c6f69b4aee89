pub trait RemoteResponse<T> {
    type Error;

    /// Converts the wire payload into the domain model.
    fn to_model(&self) -> Result<T, Self::Error>;
}
