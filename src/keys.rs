use crate::job::JobState;

/// The KV store key for a document's job record
pub fn doc_key(document_id: &str) -> String {
    format!("docs/{}", document_id)
}

/// Secondary index entry listing a document under its current state:
/// state/<state>/<document_id>
pub fn state_index_key(state: JobState, document_id: &str) -> String {
    format!("state/{}/{}", state.as_str(), document_id)
}

/// Prefix covering every index entry for one state
pub fn state_index_prefix(state: JobState) -> String {
    format!("state/{}/", state.as_str())
}

/// Extract the document id from a state index key
pub fn parse_state_index_key(state: JobState, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(&state_index_prefix(state))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Exclusive upper bound for a prefix scan
pub fn end_bound(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    end.push(0xFF);
    end
}
