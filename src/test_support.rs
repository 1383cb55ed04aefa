//! Shared fixtures for unit tests across modules.

#![cfg(test)]

use crate::email::Email;
use chrono::Utc;
use std::collections::HashMap;

pub fn sample_email(id: &str) -> Email {
    Email {
        id: id.to_string(),
        from: "sender@example.test".to_string(),
        to: vec!["recipient@example.test".to_string()],
        subject: "Test subject".to_string(),
        text: Some("hello".to_string()),
        html: None,
        received_at: Utc::now(),
        headers: HashMap::new(),
        attachments: Vec::new(),
        links: Vec::new(),
        auth_results: None,
        spam_analysis: None,
    }
}
