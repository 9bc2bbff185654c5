pub mod invoicesrpc {
    tonic::include_proto!("invoicesrpc");
}
