// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Retrieval of notarization tickets.

Apple publishes the ticket of every accepted notarization in a public
CloudKit database. Tickets are keyed by a record name derived from the Code
Directory hash of the notarized binary.
*/

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        error::{MachoCodesignError, StapleError},
    },
    log::info,
    reqwest::{Client, ClientBuilder},
    serde::{Deserialize, Serialize},
    std::{collections::HashMap, time::Duration},
};

/// URL of HTTP service where Apple publishes stapling tickets.
pub const APPLE_TICKET_LOOKUP_URL: &str = "https://api.apple-cloudkit.com/database/1/com.apple.gk.ticket-delivery/production/public/records/lookup";

/// Main JSON request object for ticket lookup requests.
#[derive(Clone, Debug, Serialize)]
pub struct TicketLookupRequest {
    pub records: Vec<TicketLookupRequestRecord>,
}

/// Represents a single record to look up in a ticket lookup request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupRequestRecord {
    pub record_name: String,
}

/// Main JSON response object to ticket lookup requests.
#[derive(Clone, Debug, Deserialize)]
pub struct TicketLookupResponse {
    pub records: Vec<TicketLookupResponseRecord>,
}

impl TicketLookupResponse {
    /// Obtain the signed ticket for a given record name.
    pub fn signed_ticket(&self, record_name: &str) -> Result<Vec<u8>, StapleError> {
        let lookup_error = |reason: String| StapleError::Lookup {
            record_name: record_name.to_string(),
            reason,
        };

        let record = self
            .records
            .iter()
            .find(|r| r.record_name() == record_name)
            .ok_or_else(|| lookup_error("record not in response".into()))?;

        match record {
            TicketLookupResponseRecord::Success(r) => r
                .signed_ticket_data()
                .ok_or_else(|| lookup_error("record has no signed ticket".into()))?
                .map_err(lookup_error),
            TicketLookupResponseRecord::Failure(r) => Err(lookup_error(format!(
                "{}: {}",
                r.server_error_code, r.reason
            ))),
        }
    }
}

/// Describes the results of a ticket lookup for a specific record.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TicketLookupResponseRecord {
    /// Ticket was found.
    Success(TicketLookupResponseRecordSuccess),

    /// Some error occurred.
    Failure(TicketLookupResponseRecordFailure),
}

impl TicketLookupResponseRecord {
    pub fn record_name(&self) -> &str {
        match self {
            Self::Success(r) => &r.record_name,
            Self::Failure(r) => &r.record_name,
        }
    }
}

/// Represents a successful ticket lookup response record.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordSuccess {
    pub record_name: String,

    /// The `signedTicket` key holds the ticket.
    pub fields: HashMap<String, Field>,

    /// A value like `DeveloperIDTicket`.
    pub record_type: String,
}

impl TicketLookupResponseRecordSuccess {
    /// Obtain the raw signed ticket data in this record.
    ///
    /// `None` if the record has no ticket. The inner `Err` describes a ticket
    /// we couldn't decode.
    pub fn signed_ticket_data(&self) -> Option<Result<Vec<u8>, String>> {
        self.fields.get("signedTicket").map(|field| {
            if field.typ == "BYTES" {
                base64::decode(&field.value).map_err(|e| format!("bad ticket encoding: {}", e))
            } else {
                Err(format!("ticket field has type {}, expected BYTES", field.typ))
            }
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLookupResponseRecordFailure {
    pub record_name: String,
    pub reason: String,
    pub server_error_code: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub typ: String,
    pub value: String,
}

/// The ticket record name for a Code Directory.
///
/// Of the form `2/<digest_type>/<hex of the truncated CD hash>`.
pub fn ticket_record_name(cd: &CodeDirectoryBlob) -> Result<String, MachoCodesignError> {
    Ok(format!(
        "2/{}/{}",
        u8::from(cd.hash_type),
        hex::encode(cd.cdhash_truncated()?)
    ))
}

/// Obtain the default [Client] to use for HTTP requests.
pub fn default_client(timeout: Duration) -> Result<Client, MachoCodesignError> {
    Ok(ClientBuilder::default()
        .user_agent(concat!("macho-codesign/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()?)
}

/// Look up a single notarization ticket and return its bytes.
pub async fn lookup_notarization_ticket(
    client: &Client,
    record_name: &str,
) -> Result<Vec<u8>, StapleError> {
    let lookup_error = |reason: String| StapleError::Lookup {
        record_name: record_name.to_string(),
        reason,
    };

    info!("looking up notarization ticket for {}", record_name);

    let body = TicketLookupRequest {
        records: vec![TicketLookupRequestRecord {
            record_name: record_name.to_string(),
        }],
    };

    let response = client
        .post(APPLE_TICKET_LOOKUP_URL)
        .header("Accept", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| lookup_error(e.to_string()))?;

    let body = response
        .bytes()
        .await
        .map_err(|e| lookup_error(e.to_string()))?;

    serde_json::from_slice::<TicketLookupResponse>(&body)
        .map_err(|e| lookup_error(format!("unparseable response: {}", e)))?
        .signed_ticket(record_name)
}

#[cfg(test)]
mod test {
    use {super::*, crate::code_directory::CodeDirectoryBuilder, crate::embedded_signature::DigestType};

    const RECORD: &str = "2/2/1b747faf223750de74febed7929f14a73af8c933";

    #[test]
    fn parse_success_response() -> Result<(), StapleError> {
        let json = format!(
            r#"{{"records": [{{
                "recordName": "{}",
                "recordType": "DeveloperIDTicket",
                "recordChangeTag": "abc",
                "deleted": false,
                "fields": {{"signedTicket": {{"type": "BYTES", "value": "czhjaAEAAAA="}}}}
            }}]}}"#,
            RECORD
        );

        let response = serde_json::from_str::<TicketLookupResponse>(&json).unwrap();
        assert!(matches!(
            &response.records[0],
            TicketLookupResponseRecord::Success(_)
        ));

        let ticket = response.signed_ticket(RECORD)?;
        assert_eq!(&ticket[0..4], b"s8ch");

        assert!(matches!(
            response.signed_ticket("2/2/00"),
            Err(StapleError::Lookup { .. })
        ));

        Ok(())
    }

    #[test]
    fn parse_failure_response() {
        let json = format!(
            r#"{{"records": [{{
                "recordName": "{}",
                "reason": "Record not found",
                "serverErrorCode": "NOT_FOUND"
            }}]}}"#,
            RECORD
        );

        let response = serde_json::from_str::<TicketLookupResponse>(&json).unwrap();
        assert!(matches!(
            &response.records[0],
            TicketLookupResponseRecord::Failure(_)
        ));

        match response.signed_ticket(RECORD) {
            Err(StapleError::Lookup { record_name, reason }) => {
                assert_eq!(record_name, RECORD);
                assert_eq!(reason, "NOT_FOUND: Record not found");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn record_name_uses_truncated_cdhash() -> Result<(), MachoCodesignError> {
        let cd = CodeDirectoryBuilder::new("com.example", DigestType::Sha256, 4096)
            .build(&[0u8; 100])?;

        let name = ticket_record_name(&cd)?;
        let hash = cd.cdhash()?;

        assert_eq!(name, format!("2/2/{}", hex::encode(&hash[0..20])));

        Ok(())
    }
}
