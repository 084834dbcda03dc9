//! Response builders for requests answered by a collaborator.
//!
//! Both sides of the link answer some requests by calling into a port
//! (data store, invoke router, attribute provider). The builders here turn
//! the collaborator outcome into the matching response envelope.

use crate::envelope::Envelope;
use crate::errors::{ERR_BAD_REQUEST, EnvelopeError};
use crate::payload::{DataQuery, DataQueryResult, InvokeRequest, InvokeResult, NodeInfo, Payload};
use crate::ports::{AttributeProvider, DataQueryExecutor, InvokeRouter};

/// Copy the fields of `payload` into `envelope`.
pub fn attach<P: Payload>(mut envelope: Envelope, payload: &P) -> Result<Envelope, EnvelopeError> {
    for (key, value) in payload.to_fields()? {
        envelope.set_field(key, value)?;
    }
    Ok(envelope)
}

/// Answer a `DataQueryReq`.
pub async fn data_query(executor: &dyn DataQueryExecutor, request: &Envelope) -> Result<Envelope, EnvelopeError> {
    let response = Envelope::derive_response(request)?;
    let query = match DataQuery::from_envelope(request) {
        Ok(query) => query,
        Err(error) => return Ok(response.with_error(ERR_BAD_REQUEST, error.to_string())),
    };
    match executor
        .query(&query.exchangeable, &query.data_info, query.trading_day.as_deref())
        .await
    {
        Ok(data) => attach(response, &DataQueryResult { data }),
        Err(error) => Ok(response.with_error(error.query_code(), error.to_string())),
    }
}

/// Answer a `ControllerInvokeReq`.
pub async fn invoke(router: &dyn InvokeRouter, request: &Envelope) -> Result<Envelope, EnvelopeError> {
    let response = Envelope::derive_response(request)?;
    let call = match InvokeRequest::from_envelope(request) {
        Ok(call) => call,
        Err(error) => return Ok(response.with_error(ERR_BAD_REQUEST, error.to_string())),
    };
    match router.invoke(&call.path, &call.params).await {
        Ok(result) => attach(response, &InvokeResult { result }),
        Err(error) => Ok(response.with_error(error.invoke_code(), error.to_string())),
    }
}

/// Answer a `NodeInfoReq`.
pub async fn node_info(provider: &dyn AttributeProvider, request: &Envelope) -> Result<Envelope, EnvelopeError> {
    let response = Envelope::derive_response(request)?;
    attach(
        response,
        &NodeInfo {
            attrs: provider.node_attributes().await,
        },
    )
}
