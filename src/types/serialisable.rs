/// Types implementing WireSerialisable can be written back to a gateway
/// client as a response.
pub trait WireSerialisable {
    /// Converts the value in question to its on-the-wire form, including the
    /// trailing CRLF.
    fn serialise_wire(&self) -> Vec<u8>;
}
