//! Small helpers for the server.

//----------- to_pcap_text() -------------------------------------------------

/// Formats the first `num_bytes` octets as text `text2pcap` understands.
///
/// The output is a single line with an offset of zero followed by the
/// octets in hex, so it can be pasted into a file and converted into a
/// capture for Wireshark.
pub(crate) fn to_pcap_text<T: AsRef<[u8]>>(
    bytes: T,
    num_bytes: usize,
) -> String {
    let bytes = bytes.as_ref();
    let end = num_bytes.min(bytes.len());
    let hex_encoded = hex::encode(&bytes[..end]);
    let mut formatted = String::with_capacity(6 + hex_encoded.len() * 3 / 2);
    formatted.push_str("000000");
    for pair in hex_encoded.as_bytes().chunks(2) {
        formatted.push(' ');
        formatted.extend(pair.iter().map(|&c| char::from(c)));
    }
    formatted
}

//============ Testing =======================================================
