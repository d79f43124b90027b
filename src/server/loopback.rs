//! In-process transport
//!
//! Hands requests straight to a [`Dispatcher`] without a socket. Used to
//! embed a server in the same process as its client, and by the tests.

use crate::client::{HttpRequest, HttpResponse, RequestBody, Transport};
use crate::error::Result;
use crate::server::{Dispatcher, ServerRequest, UploadedFile};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Transport calling a dispatcher directly
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    dispatcher: Arc<Dispatcher>,
    client_ip: IpAddr,
}

impl LoopbackTransport {
    /// Transport presenting itself as `127.0.0.1`
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_client_ip(dispatcher, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Transport presenting itself as `client_ip`
    pub fn with_client_ip(dispatcher: Arc<Dispatcher>, client_ip: IpAddr) -> Self {
        Self {
            dispatcher,
            client_ip,
        }
    }
}

impl Transport for LoopbackTransport {
    fn execute(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let mut params: Vec<(String, String)> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let upload = match request.body {
            RequestBody::Form(fields) => {
                params.extend(fields);
                None
            }
            RequestBody::Multipart { fields, mut file } => {
                params.extend(fields);
                let mut content = NamedTempFile::new()?;
                io::copy(&mut file.content, content.as_file_mut())?;
                content.as_file_mut().flush()?;
                Some(UploadedFile {
                    file_name: file.file_name,
                    content,
                })
            }
        };

        let reply = self.dispatcher.dispatch(ServerRequest {
            params,
            client_ip: self.client_ip,
            upload,
        });
        Ok(HttpResponse {
            status: 200,
            body: reply.into_body()?,
        })
    }

    fn duplicate(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }
}
