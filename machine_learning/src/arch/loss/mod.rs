mod softmax_cross_entropy;

pub use softmax_cross_entropy::SoftmaxCrossEntropy;
